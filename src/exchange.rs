pub mod binance;
pub mod bybit;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::ExchangeError;
use crate::model::{Candle, ExchangeKind, MarketType, TimeFrame};

/// Abstraction over a cryptocurrency exchange's public REST surface.
///
/// Uses `BoxFuture` (from the `futures` crate) instead of `async fn` in
/// trait to keep the trait object-safe (`dyn Exchange`). Market data is
/// polled on demand by the fetcher rather than streamed; there is no
/// websocket subscription surface here.
pub trait Exchange: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    /// Fetch historical candle data via REST API, newest-last.
    fn fetch_candles(
        &self,
        symbol: &str,
        market: MarketType,
        timeframe: TimeFrame,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>>;

    /// Fetch the latest traded price for `symbol`.
    fn fetch_current_price(
        &self,
        symbol: &str,
        market: MarketType,
    ) -> BoxFuture<'_, Result<f64, Report<ExchangeError>>>;
}
