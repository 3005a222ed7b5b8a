use std::collections::HashMap;
use std::sync::Arc;

use error_stack::Report;
use tracing::{info, warn};

use crate::cache::DiskCache;
use crate::error::MarketDataError;
use crate::exchange::Exchange;
use crate::model::{Candle, ExchangeKind, MarketType, TimeFrame};

/// A fetch returning fewer than this many candles is too thin to evaluate
/// signals on and triggers the same fallback path as an outright failure.
const MIN_CANDLES: usize = 20;

/// Fetches candle data, consulting the disk cache before going to the
/// network, and falling back to the alternate exchange once if the
/// primary one fails outright or returns too few candles to be useful.
pub struct MarketDataFetcher {
    exchanges: HashMap<ExchangeKind, Arc<dyn Exchange>>,
    cache: DiskCache,
}

impl MarketDataFetcher {
    pub fn new(exchanges: HashMap<ExchangeKind, Arc<dyn Exchange>>, cache: DiskCache) -> Self {
        Self { exchanges, cache }
    }

    /// Fetch `limit` candles for `symbol`/`timeframe` on `exchange`, serving
    /// a fresh cache entry when available, otherwise hitting the exchange
    /// and falling back to the alternate exchange on failure or a thin
    /// result.
    pub async fn fetch_candles(
        &self,
        exchange: ExchangeKind,
        market: MarketType,
        symbol: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> Result<Vec<Candle>, Report<MarketDataError>> {
        if let Ok(Some(cached)) = self.cache.read(exchange, market, symbol, timeframe).await {
            if cached.len() >= limit {
                return Ok(cached);
            }
        }

        match self.fetch_from(exchange, market, symbol, timeframe, limit).await {
            Ok(candles) if candles.len() >= MIN_CANDLES => {
                let _ = self.cache.write(exchange, market, symbol, timeframe, &candles).await;
                Ok(candles)
            }
            primary_result => {
                let primary_err = match primary_result {
                    Ok(thin) => {
                        warn!(
                            exchange = %exchange,
                            symbol,
                            got = thin.len(),
                            "primary exchange fetch too thin to use, attempting fallback"
                        );
                        None
                    }
                    Err(e) => Some(e),
                };

                let alternate = exchange.alternate();
                warn!(
                    exchange = %exchange,
                    alternate = %alternate,
                    symbol,
                    "primary exchange fetch failed, attempting fallback"
                );
                match self.fetch_from(alternate, market, symbol, timeframe, limit).await {
                    Ok(candles) if candles.len() >= MIN_CANDLES => {
                        info!(exchange = %alternate, symbol, "fallback exchange fetch succeeded");
                        let _ = self
                            .cache
                            .write(alternate, market, symbol, timeframe, &candles)
                            .await;
                        Ok(candles)
                    }
                    fallback_result => {
                        if let Ok(Some(stale)) =
                            self.cache.read(exchange, market, symbol, timeframe).await
                        {
                            warn!(exchange = %exchange, symbol, "serving stale cache after both exchanges failed");
                            return Ok(stale);
                        }

                        let base = match (primary_err, fallback_result) {
                            (Some(e), _) => e,
                            (None, Err(e)) => e,
                            (None, Ok(thin)) => {
                                // Both attempts succeeded but stayed thin and
                                // there's no stale cache to fall back on.
                                return Ok(thin);
                            }
                        };
                        let retryable = base.current_context().is_retryable();
                        Err(base.change_context(MarketDataError::AllExchangesExhausted {
                            symbol: symbol.to_owned(),
                            retryable,
                        }))
                    }
                }
            }
        }
    }

    /// Fetches from a single exchange, resolving `MarketType::Auto` by
    /// trying futures then spot and keeping the first result that clears
    /// `MIN_CANDLES`.
    async fn fetch_from(
        &self,
        exchange: ExchangeKind,
        market: MarketType,
        symbol: &str,
        timeframe: TimeFrame,
        limit: usize,
    ) -> Result<Vec<Candle>, Report<MarketDataError>> {
        let handle = self.exchanges.get(&exchange).ok_or_else(|| {
            Report::new(MarketDataError::NoCacheAvailable {
                symbol: symbol.to_owned(),
                timeframe: timeframe.to_string(),
            })
        })?;

        let mut thin: Option<Vec<Candle>> = None;
        let mut last_err: Option<Report<MarketDataError>> = None;

        for &concrete_market in market.resolution_order() {
            match handle.fetch_candles(symbol, concrete_market, timeframe, limit).await {
                Ok(candles) if candles.len() >= MIN_CANDLES => return Ok(candles),
                Ok(candles) => {
                    thin.get_or_insert(candles);
                }
                Err(e) => {
                    let retryable = e.current_context().is_retryable();
                    last_err = Some(e.change_context(MarketDataError::Exchange { retryable }));
                }
            }
        }

        match (thin, last_err) {
            (Some(candles), _) => Ok(candles),
            (None, Some(e)) => Err(e),
            (None, None) => unreachable!("resolution_order always yields at least one market"),
        }
    }
}
