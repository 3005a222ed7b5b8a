use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use tracing::info;

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::model::{Candle, ExchangeKind, MarketType, TimeFrame};

const BYBIT_BASE_URL: &str = "https://api.bybit.com";
const MAX_CANDLES_PER_REQUEST: usize = 1000;

pub struct BybitExchange {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl BybitExchange {
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second.max(1)).unwrap();
        let quota = Quota::per_second(rps);
        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// `Auto` is resolved to a concrete market by the fetcher before a
    /// request ever reaches an exchange; falls back to linear (futures).
    fn category(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => "spot",
            MarketType::Futures | MarketType::Auto => "linear",
        }
    }
}

impl Default for BybitExchange {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Exchange for BybitExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Bybit
    }

    fn fetch_candles(
        &self,
        symbol: &str,
        market: MarketType,
        timeframe: TimeFrame,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/v5/market/kline", BYBIT_BASE_URL);
            let interval = timeframe.bybit_interval();
            let fetch_limit = limit.min(MAX_CANDLES_PER_REQUEST);
            let limit_str = fetch_limit.to_string();
            let category = Self::category(market);

            let params = [
                ("category", category),
                ("symbol", symbol.as_str()),
                ("interval", interval),
                ("limit", limit_str.as_str()),
            ];

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .change_context(ExchangeError::TransientNetwork {
                    exchange: "bybit".into(),
                })?;

            if response.status().as_u16() == 429 {
                return Err(Report::new(ExchangeError::RateLimit {
                    exchange: "bybit".into(),
                }));
            }

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "bybit".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let parsed: BybitKlineResponse =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "bybit".into(),
                    })?;

            if parsed.ret_code == 10001 {
                return Err(Report::new(ExchangeError::SymbolUnknown {
                    exchange: "bybit".into(),
                    symbol: symbol.clone(),
                }));
            }

            if parsed.ret_code != 0 {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "bybit".into(),
                })
                .attach(format!("retCode {}: {}", parsed.ret_code, parsed.ret_msg)));
            }

            info!(
                symbol = %symbol,
                timeframe = %timeframe,
                market = %market,
                fetched = parsed.result.list.len(),
                "bybit candle fetch complete"
            );

            // Bybit returns rows newest-first; reverse to the oldest-first
            // convention the rest of the system expects.
            let mut candles = parsed
                .result
                .list
                .into_iter()
                .map(|row| row.into_candle(&symbol, timeframe))
                .collect::<Result<Vec<_>, _>>()?;
            candles.reverse();

            Ok(candles)
        })
    }

    fn fetch_current_price(
        &self,
        symbol: &str,
        market: MarketType,
    ) -> BoxFuture<'_, Result<f64, Report<ExchangeError>>> {
        let symbol = symbol.to_owned();
        Box::pin(async move {
            self.rate_limiter.until_ready().await;

            let url = format!("{}/v5/market/tickers", BYBIT_BASE_URL);
            let category = Self::category(market);
            let response = self
                .client
                .get(&url)
                .query(&[("category", category), ("symbol", symbol.as_str())])
                .send()
                .await
                .change_context(ExchangeError::TransientNetwork {
                    exchange: "bybit".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "bybit".into(),
                }));
            }

            let parsed: BybitTickerResponse =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "bybit".into(),
                    })?;

            let ticker = parsed.result.list.into_iter().next().ok_or_else(|| {
                Report::new(ExchangeError::SymbolUnknown {
                    exchange: "bybit".into(),
                    symbol: symbol.clone(),
                })
            })?;

            ticker
                .last_price
                .parse::<f64>()
                .change_context(ExchangeError::ResponseParse {
                    exchange: "bybit".into(),
                })
        })
    }
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BybitKlineResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: BybitKlineResult,
}

#[derive(Debug, Deserialize)]
struct BybitKlineResult {
    list: Vec<BybitKlineRow>,
}

/// Row is `[start, open, high, low, close, volume, turnover]`, all strings.
#[derive(Debug, Deserialize)]
struct BybitKlineRow(String, String, String, String, String, String, String);

impl BybitKlineRow {
    fn into_candle(
        self,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<Candle, Report<ExchangeError>> {
        let parse_f64 = |s: &str| -> Result<f64, Report<ExchangeError>> {
            s.parse::<f64>()
                .change_context(ExchangeError::ResponseParse {
                    exchange: "bybit".into(),
                })
        };
        let open_time_ms = self
            .0
            .parse::<i64>()
            .change_context(ExchangeError::ResponseParse {
                exchange: "bybit".into(),
            })?;
        let open_time = DateTime::from_timestamp_millis(open_time_ms).unwrap_or_else(Utc::now);

        Ok(Candle {
            exchange: ExchangeKind::Bybit,
            symbol: symbol.to_owned(),
            timeframe,
            open_time,
            open: parse_f64(&self.1)?,
            high: parse_f64(&self.2)?,
            low: parse_f64(&self.3)?,
            close: parse_f64(&self.4)?,
            volume: parse_f64(&self.5)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct BybitTickerResponse {
    result: BybitTickerResult,
}

#[derive(Debug, Deserialize)]
struct BybitTickerResult {
    list: Vec<BybitTicker>,
}

#[derive(Debug, Deserialize)]
struct BybitTicker {
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bybit_kline_row_parses_into_candle() {
        let row = BybitKlineRow(
            "1704067200000".into(),
            "42000.0".into(),
            "43000.0".into(),
            "41500.0".into(),
            "42500.0".into(),
            "100.5".into(),
            "1000000".into(),
        );
        let candle = row.into_candle("BTCUSDT", TimeFrame::Min1).unwrap();
        assert_eq!(candle.exchange, ExchangeKind::Bybit);
        assert_eq!(candle.close, 42500.0);
    }

    #[test]
    fn category_mapping() {
        assert_eq!(BybitExchange::category(MarketType::Spot), "spot");
        assert_eq!(BybitExchange::category(MarketType::Futures), "linear");
    }

    /// Integration test: requires network access. Run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn integration_fetch_candles() {
        let exchange = BybitExchange::new(10);
        let candles = exchange
            .fetch_candles("BTCUSDT", MarketType::Spot, TimeFrame::Min1, 10)
            .await
            .unwrap();
        assert!(!candles.is_empty());
    }
}
