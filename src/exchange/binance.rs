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

const BINANCE_SPOT_BASE_URL: &str = "https://api.binance.com";
const BINANCE_FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const MAX_CANDLES_PER_REQUEST: usize = 1000;

pub struct BinanceExchange {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl BinanceExchange {
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second.max(1)).unwrap();
        let quota = Quota::per_second(rps);
        Self {
            client: reqwest::Client::new(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// `Auto` is resolved to a concrete market by the fetcher before a
    /// request ever reaches an exchange; these fall back to futures so an
    /// unresolved `Auto` still does something sensible rather than panic.
    fn base_url(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => BINANCE_SPOT_BASE_URL,
            MarketType::Futures | MarketType::Auto => BINANCE_FUTURES_BASE_URL,
        }
    }

    fn klines_path(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => "/api/v3/klines",
            MarketType::Futures | MarketType::Auto => "/fapi/v1/klines",
        }
    }

    fn price_path(market: MarketType) -> &'static str {
        match market {
            MarketType::Spot => "/api/v3/ticker/price",
            MarketType::Futures | MarketType::Auto => "/fapi/v1/ticker/price",
        }
    }
}

impl Default for BinanceExchange {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Exchange for BinanceExchange {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Binance
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

            let url = format!("{}{}", Self::base_url(market), Self::klines_path(market));
            let interval = timeframe.binance_interval();
            let fetch_limit = limit.min(MAX_CANDLES_PER_REQUEST);

            let limit_str = fetch_limit.to_string();
            let params = [
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
                    exchange: "binance".into(),
                })?;

            if response.status().as_u16() == 429 || response.status().as_u16() == 418 {
                return Err(Report::new(ExchangeError::RateLimit {
                    exchange: "binance".into(),
                }));
            }

            if response.status().as_u16() == 400 {
                return Err(Report::new(ExchangeError::SymbolUnknown {
                    exchange: "binance".into(),
                    symbol: symbol.clone(),
                }));
            }

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<BinanceKlineRow> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            info!(
                symbol = %symbol,
                timeframe = %timeframe,
                market = %market,
                fetched = raw.len(),
                "binance candle fetch complete"
            );

            let candles = raw
                .into_iter()
                .map(|row: BinanceKlineRow| row.into_candle(&symbol, timeframe))
                .collect::<Result<Vec<_>, _>>()?;

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

            let url = format!("{}{}", Self::base_url(market), Self::price_path(market));
            let response = self
                .client
                .get(&url)
                .query(&[("symbol", symbol.as_str())])
                .send()
                .await
                .change_context(ExchangeError::TransientNetwork {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                }));
            }

            let parsed: BinancePriceRow =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            parsed
                .price
                .parse::<f64>()
                .change_context(ExchangeError::ResponseParse {
                    exchange: "binance".into(),
                })
        })
    }
}

// ── REST response types ───────────────────────────────────────────────────────

/// Binance kline row: 12-element array
/// [open_time, open, high, low, close, volume, close_time, ...]
#[derive(Debug, Deserialize)]
struct BinanceKlineRow(
    i64,                        // 0: open_time (ms)
    String,                     // 1: open
    String,                     // 2: high
    String,                     // 3: low
    String,                     // 4: close
    String,                     // 5: volume
    #[allow(dead_code)] i64,    // 6: close_time
    #[allow(dead_code)] String, // 7: quote asset volume
    #[allow(dead_code)] i64,    // 8: number of trades
    #[allow(dead_code)] String, // 9: taker buy base volume
    #[allow(dead_code)] String, // 10: taker buy quote volume
    #[allow(dead_code)] String, // 11: ignore
);

impl BinanceKlineRow {
    fn into_candle(
        self,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> Result<Candle, Report<ExchangeError>> {
        let parse_f64 = |s: &str| -> Result<f64, Report<ExchangeError>> {
            s.parse::<f64>()
                .change_context(ExchangeError::ResponseParse {
                    exchange: "binance".into(),
                })
        };

        let open_time = DateTime::from_timestamp_millis(self.0).unwrap_or_else(Utc::now);

        Ok(Candle {
            exchange: ExchangeKind::Binance,
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
struct BinancePriceRow {
    price: String,
}
