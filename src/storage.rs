pub mod sqlite;

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::model::{
    PriceAlert, ScreeningSchedule, SignalHistoryRow, SignalOutcome, Subscription, TierChange,
    TimeFrame, User,
};

/// Persistence for users, subscriptions, alerts, screening schedules and
/// signal history. Candle data lives in the on-disk cache (see `cache`),
/// not here — this trait is the application's durable state, not market
/// data.
pub trait Storage: Send + Sync {
    fn upsert_user(&self, user: &User) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn get_user(&self, chat_id: i64) -> BoxFuture<'_, Result<Option<User>, Report<StorageError>>>;

    /// Add a subscription. Idempotent: adding an existing (chat_id, symbol,
    /// timeframe) triple is a no-op, not an error.
    fn add_subscription(
        &self,
        sub: &Subscription,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn remove_subscription(
        &self,
        chat_id: i64,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn list_subscriptions(
        &self,
        chat_id: i64,
    ) -> BoxFuture<'_, Result<Vec<Subscription>, Report<StorageError>>>;

    /// All subscriptions across all users, grouped for the orchestrator's
    /// per-tick scan.
    fn all_subscriptions(&self) -> BoxFuture<'_, Result<Vec<Subscription>, Report<StorageError>>>;

    fn count_subscriptions(
        &self,
        chat_id: i64,
    ) -> BoxFuture<'_, Result<usize, Report<StorageError>>>;

    fn add_alert(&self, alert: &PriceAlert) -> BoxFuture<'_, Result<i64, Report<StorageError>>>;

    fn remove_alert(&self, id: i64) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn list_alerts(
        &self,
        chat_id: i64,
    ) -> BoxFuture<'_, Result<Vec<PriceAlert>, Report<StorageError>>>;

    /// All alerts not yet triggered, scanned by the orchestrator each tick.
    fn active_alerts(&self) -> BoxFuture<'_, Result<Vec<PriceAlert>, Report<StorageError>>>;

    /// Atomically claim an untriggered alert (`WHERE triggered = 0`).
    /// Returns `true` if this call flipped it (the caller owns the
    /// notification), `false` if another caller already claimed it.
    fn mark_alert_triggered(&self, id: i64) -> BoxFuture<'_, Result<bool, Report<StorageError>>>;

    /// Revert a claimed alert back to untriggered, used when the claiming
    /// caller's notification send failed so a later tick can retry.
    fn reset_alert_triggered(&self, id: i64) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn count_alerts(&self, chat_id: i64) -> BoxFuture<'_, Result<usize, Report<StorageError>>>;

    fn upsert_screening_schedule(
        &self,
        schedule: &ScreeningSchedule,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn list_screening_schedules(
        &self,
    ) -> BoxFuture<'_, Result<Vec<ScreeningSchedule>, Report<StorageError>>>;

    fn update_screening_last_run(
        &self,
        chat_id: i64,
        timeframe: TimeFrame,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn record_signal(
        &self,
        row: &SignalHistoryRow,
    ) -> BoxFuture<'_, Result<i64, Report<StorageError>>>;

    fn update_signal_outcome(
        &self,
        id: i64,
        outcome: SignalOutcome,
        actual_return_pct: f64,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn signal_history(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<SignalHistoryRow>, Report<StorageError>>>;

    /// All signals still awaiting an outcome, for the tracker's periodic
    /// resolution pass.
    fn pending_signals(
        &self,
    ) -> BoxFuture<'_, Result<Vec<SignalHistoryRow>, Report<StorageError>>>;

    /// Generic per-user preference storage (notification formatting, UI
    /// toggles). The core doesn't read any of these keys itself — this is
    /// a write surface for the peripheral chat command layer.
    fn get_preference(
        &self,
        chat_id: i64,
        key: &str,
    ) -> BoxFuture<'_, Result<Option<String>, Report<StorageError>>>;

    fn set_preference(
        &self,
        chat_id: i64,
        key: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    /// Append-only tier/billing audit log (`subscription_history`).
    /// Insertion point for the peripheral admin/billing flow; the core
    /// never reads it back.
    fn record_tier_event(
        &self,
        event: &TierChange,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;
}
