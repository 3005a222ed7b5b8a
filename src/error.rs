use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

/// Exchange-facing failures, realizing the error taxonomy: transient
/// network issues are retried by the caller, rate limiting backs off,
/// unknown symbols and parse failures are not retried.
#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    #[display("failed to connect to {exchange}")]
    Connection { exchange: String },
    #[display("request to {exchange} failed")]
    Request { exchange: String },
    #[display("failed to parse response from {exchange}")]
    ResponseParse { exchange: String },
    #[display("rate limit exceeded for {exchange}")]
    RateLimit { exchange: String },
    #[display("{symbol} is not known to {exchange}")]
    SymbolUnknown { exchange: String, symbol: String },
    #[display("transient network error contacting {exchange}")]
    TransientNetwork { exchange: String },
}

impl ExchangeError {
    /// Whether the orchestrator's retry policy should re-attempt after
    /// this failure (as opposed to failing the work item immediately).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::TransientNetwork { .. } | Self::RateLimit { .. }
        )
    }
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
    #[display("database error: {reason}")]
    DatabaseError { reason: String },
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("insufficient data: need {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}

/// Failures from the market data fetcher: a thin wrapper adding the
/// cache/fallback context that a bare `ExchangeError` does not carry.
#[derive(Debug, Display, Error)]
pub enum MarketDataError {
    /// Carries the originating `ExchangeError`'s retryability forward, since
    /// the bare exchange error is discarded once it's wrapped here.
    #[display("exchange request failed")]
    Exchange { retryable: bool },
    #[display("no cached candles available for {symbol} {timeframe}")]
    NoCacheAvailable { symbol: String, timeframe: String },
    /// Carries forward whether the root failure (before both exchanges and
    /// the stale cache were exhausted) was itself retryable.
    #[display("all exchanges exhausted for {symbol}")]
    AllExchangesExhausted { symbol: String, retryable: bool },
}

impl MarketDataError {
    /// Whether a caller should retry this fetch. `NoCacheAvailable` (the
    /// exchange isn't configured at all) never retries; the other variants
    /// carry the originating failure's retryability forward.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Exchange { retryable } | Self::AllExchangesExhausted { retryable, .. } => {
                *retryable
            }
            Self::NoCacheAvailable { .. } => false,
        }
    }
}

/// Failures producing a trading plan.
#[derive(Debug, Display, Error)]
pub enum PlanError {
    #[display("insufficient market data to evaluate {symbol}")]
    InsufficientData { symbol: String },
    #[display("plan generation failed for {symbol}: {reason}")]
    PlanGenerationFailed { symbol: String, reason: String },
    #[display("model response for {symbol} failed validation: {reason}")]
    InvalidModelResponse { symbol: String, reason: String },
    #[display("model request for {symbol} timed out")]
    Timeout { symbol: String },
}

/// Failures screening the market.
#[derive(Debug, Display, Error)]
pub enum ScreenError {
    #[display("failed to fetch candidate universe")]
    UniverseUnavailable,
    #[display("local scoring failed for {symbol}")]
    ScoringFailed { symbol: String },
}

/// Failures in the subscription/user store layer.
#[derive(Debug, Display, Error)]
pub enum StoreError {
    #[display("user {chat_id} is not allowed to perform this action")]
    NotAllowed { chat_id: i64 },
    #[display("limit exceeded: {limit_name} ({current}/{max})")]
    LimitExceeded {
        limit_name: String,
        current: usize,
        max: usize,
    },
    #[display("{source}")]
    Storage { source: StorageError },
}

/// Failures delivering a message to a subscriber.
#[derive(Debug, Display, Error)]
pub enum NotifyError {
    #[display("failed to send message to chat {chat_id}")]
    SendFailed { chat_id: i64 },
    #[display("telegram rejected the request: {reason}")]
    Rejected { reason: String },
    #[display("notifier is not configured")]
    NotConfigured,
}

/// Failures surfaced at the orchestrator level, above any single work item.
#[derive(Debug, Display, Error)]
pub enum OrchestratorError {
    #[display("work queue is full")]
    QueueFull,
    #[display("work item for {symbol} timed out past its deadline")]
    DeadlineExceeded { symbol: String },
    #[display("work item cancelled")]
    Cancelled,
}
