use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::path::Path;
use std::str::FromStr;

use crate::error::StorageError;
use crate::model::{
    AlertDirection, ExchangeKind, MarketType, PriceAlert, ScreeningSchedule, SignalHistoryRow,
    SignalOutcome, Subscription, Tier, TierChange, TimeFrame, User,
};
use crate::storage::Storage;

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        Ok(Self { pool })
    }
}

fn parse_time_utc(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl Storage for SqliteStorage {
    fn upsert_user(&self, user: &User) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let user = user.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO users (chat_id, tier, enabled, tier_expires_at, default_exchange, market_type) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(chat_id) DO UPDATE SET \
                   tier = excluded.tier, enabled = excluded.enabled, \
                   tier_expires_at = excluded.tier_expires_at, \
                   default_exchange = excluded.default_exchange, \
                   market_type = excluded.market_type",
            )
            .bind(user.chat_id)
            .bind(user.tier.as_str())
            .bind(user.enabled as i64)
            .bind(user.tier_expires_at.map(|t| t.to_rfc3339()))
            .bind(user.default_exchange.to_string())
            .bind(user.market_type.to_string())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn get_user(&self, chat_id: i64) -> BoxFuture<'_, Result<Option<User>, Report<StorageError>>> {
        Box::pin(async move {
            #[allow(clippy::type_complexity)]
            let row: Option<(i64, String, i64, Option<String>, String, String)> = sqlx::query_as(
                "SELECT chat_id, tier, enabled, tier_expires_at, default_exchange, market_type \
                 FROM users WHERE chat_id = ?",
            )
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(row.map(
                |(chat_id, tier, enabled, tier_expires_at, default_exchange, market_type)| User {
                    chat_id,
                    tier: Tier::from_str(&tier).unwrap_or(Tier::Free),
                    enabled: enabled != 0,
                    tier_expires_at: tier_expires_at.map(|s| parse_time_utc(&s)),
                    default_exchange: ExchangeKind::from_str(&default_exchange)
                        .unwrap_or(ExchangeKind::Binance),
                    market_type: MarketType::from_str(&market_type).unwrap_or(MarketType::Spot),
                },
            ))
        })
    }

    fn add_subscription(
        &self,
        sub: &Subscription,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let sub = sub.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT OR IGNORE INTO subscriptions (chat_id, symbol, timeframe) VALUES (?, ?, ?)",
            )
            .bind(sub.chat_id)
            .bind(&sub.symbol)
            .bind(sub.timeframe.as_str())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;

            sqlx::query(
                "INSERT INTO subscription_events (chat_id, symbol, timeframe, action) \
                 VALUES (?, ?, ?, 'subscribe')",
            )
            .bind(sub.chat_id)
            .bind(&sub.symbol)
            .bind(sub.timeframe.as_str())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn remove_subscription(
        &self,
        chat_id: i64,
        symbol: &str,
        timeframe: TimeFrame,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let symbol = symbol.to_string();
        Box::pin(async move {
            sqlx::query(
                "DELETE FROM subscriptions WHERE chat_id = ? AND symbol = ? AND timeframe = ?",
            )
            .bind(chat_id)
            .bind(&symbol)
            .bind(timeframe.as_str())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;

            sqlx::query(
                "INSERT INTO subscription_events (chat_id, symbol, timeframe, action) \
                 VALUES (?, ?, ?, 'unsubscribe')",
            )
            .bind(chat_id)
            .bind(&symbol)
            .bind(timeframe.as_str())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn list_subscriptions(
        &self,
        chat_id: i64,
    ) -> BoxFuture<'_, Result<Vec<Subscription>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(i64, String, String)> = sqlx::query_as(
                "SELECT chat_id, symbol, timeframe FROM subscriptions WHERE chat_id = ?",
            )
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(rows
                .into_iter()
                .map(|(chat_id, symbol, tf)| Subscription {
                    chat_id,
                    symbol,
                    timeframe: TimeFrame::from_str(&tf).unwrap_or(TimeFrame::Hour1),
                })
                .collect())
        })
    }

    fn all_subscriptions(&self) -> BoxFuture<'_, Result<Vec<Subscription>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(i64, String, String)> =
                sqlx::query_as("SELECT chat_id, symbol, timeframe FROM subscriptions")
                    .fetch_all(&self.pool)
                    .await
                    .change_context(StorageError::Query)?;

            Ok(rows
                .into_iter()
                .map(|(chat_id, symbol, tf)| Subscription {
                    chat_id,
                    symbol,
                    timeframe: TimeFrame::from_str(&tf).unwrap_or(TimeFrame::Hour1),
                })
                .collect())
        })
    }

    fn count_subscriptions(
        &self,
        chat_id: i64,
    ) -> BoxFuture<'_, Result<usize, Report<StorageError>>> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE chat_id = ?")
                    .bind(chat_id)
                    .fetch_one(&self.pool)
                    .await
                    .change_context(StorageError::Query)?;
            Ok(count.max(0) as usize)
        })
    }

    fn add_alert(&self, alert: &PriceAlert) -> BoxFuture<'_, Result<i64, Report<StorageError>>> {
        let alert = alert.clone();
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT INTO alerts (chat_id, symbol, direction, target_price, triggered) \
                 VALUES (?, ?, ?, ?, 0)",
            )
            .bind(alert.chat_id)
            .bind(&alert.symbol)
            .bind(alert.direction.as_str())
            .bind(alert.target_price)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(result.last_insert_rowid())
        })
    }

    fn remove_alert(&self, id: i64) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        Box::pin(async move {
            sqlx::query("DELETE FROM alerts WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn list_alerts(
        &self,
        chat_id: i64,
    ) -> BoxFuture<'_, Result<Vec<PriceAlert>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(i64, i64, String, String, f64, i64)> = sqlx::query_as(
                "SELECT id, chat_id, symbol, direction, target_price, triggered \
                 FROM alerts WHERE chat_id = ?",
            )
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(rows.into_iter().map(map_alert_row).collect())
        })
    }

    fn active_alerts(&self) -> BoxFuture<'_, Result<Vec<PriceAlert>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(i64, i64, String, String, f64, i64)> = sqlx::query_as(
                "SELECT id, chat_id, symbol, direction, target_price, triggered \
                 FROM alerts WHERE triggered = 0",
            )
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(rows.into_iter().map(map_alert_row).collect())
        })
    }

    fn mark_alert_triggered(&self, id: i64) -> BoxFuture<'_, Result<bool, Report<StorageError>>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE alerts SET triggered = 1 WHERE id = ? AND triggered = 0")
                .bind(id)
                .execute(&self.pool)
                .await
                .change_context(StorageError::Insert)?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn reset_alert_triggered(&self, id: i64) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        Box::pin(async move {
            sqlx::query("UPDATE alerts SET triggered = 0 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await
                .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn count_alerts(&self, chat_id: i64) -> BoxFuture<'_, Result<usize, Report<StorageError>>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM alerts WHERE chat_id = ? AND triggered = 0",
            )
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await
            .change_context(StorageError::Query)?;
            Ok(count.max(0) as usize)
        })
    }

    fn upsert_screening_schedule(
        &self,
        schedule: &ScreeningSchedule,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let schedule = schedule.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO screening_schedules \
                 (chat_id, timeframe, interval_minutes, min_score, enabled, last_run) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(chat_id, timeframe) DO UPDATE SET \
                   interval_minutes = excluded.interval_minutes, \
                   min_score = excluded.min_score, \
                   enabled = excluded.enabled",
            )
            .bind(schedule.chat_id)
            .bind(schedule.timeframe.as_str())
            .bind(schedule.interval_minutes)
            .bind(schedule.min_score)
            .bind(schedule.enabled as i64)
            .bind(schedule.last_run.map(|t| t.to_rfc3339()))
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn list_screening_schedules(
        &self,
    ) -> BoxFuture<'_, Result<Vec<ScreeningSchedule>, Report<StorageError>>> {
        Box::pin(async move {
            #[allow(clippy::type_complexity)]
            let rows: Vec<(i64, String, i64, f64, i64, Option<String>)> = sqlx::query_as(
                "SELECT chat_id, timeframe, interval_minutes, min_score, enabled, last_run \
                 FROM screening_schedules WHERE enabled = 1",
            )
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(rows
                .into_iter()
                .map(
                    |(chat_id, tf, interval_minutes, min_score, enabled, last_run)| {
                        ScreeningSchedule {
                            chat_id,
                            timeframe: TimeFrame::from_str(&tf).unwrap_or(TimeFrame::Hour4),
                            interval_minutes,
                            min_score,
                            enabled: enabled != 0,
                            last_run: last_run.map(|s| parse_time_utc(&s)),
                        }
                    },
                )
                .collect())
        })
    }

    fn update_screening_last_run(
        &self,
        chat_id: i64,
        timeframe: TimeFrame,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        Box::pin(async move {
            sqlx::query(
                "UPDATE screening_schedules SET last_run = ? WHERE chat_id = ? AND timeframe = ?",
            )
            .bind(at.to_rfc3339())
            .bind(chat_id)
            .bind(timeframe.as_str())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn record_signal(
        &self,
        row: &SignalHistoryRow,
    ) -> BoxFuture<'_, Result<i64, Report<StorageError>>> {
        let row = row.clone();
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT INTO signal_history \
                 (chat_id, symbol, timeframe, signal, confidence, entries_json, \
                  take_profits_json, stop_loss, generated_at, outcome) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.chat_id)
            .bind(&row.symbol)
            .bind(row.timeframe.as_str())
            .bind(row.signal.as_str())
            .bind(row.confidence)
            .bind(&row.entries_json)
            .bind(&row.take_profits_json)
            .bind(row.stop_loss)
            .bind(row.generated_at.to_rfc3339())
            .bind(row.outcome.as_str())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(result.last_insert_rowid())
        })
    }

    fn update_signal_outcome(
        &self,
        id: i64,
        outcome: SignalOutcome,
        actual_return_pct: f64,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        Box::pin(async move {
            sqlx::query(
                "UPDATE signal_history SET outcome = ?, actual_return_pct = ?, outcome_at = ? \
                 WHERE id = ?",
            )
            .bind(outcome.as_str())
            .bind(actual_return_pct)
            .bind(at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn signal_history(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<SignalHistoryRow>, Report<StorageError>>> {
        Box::pin(async move {
            #[allow(clippy::type_complexity)]
            let rows: Vec<SignalHistoryRowTuple> = sqlx::query_as(
                "SELECT id, chat_id, symbol, timeframe, signal, confidence, entries_json, \
                 take_profits_json, stop_loss, generated_at, outcome, actual_return_pct, outcome_at \
                 FROM signal_history WHERE chat_id = ? ORDER BY generated_at DESC LIMIT ?",
            )
            .bind(chat_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(rows.into_iter().map(map_signal_row).collect())
        })
    }

    fn pending_signals(
        &self,
    ) -> BoxFuture<'_, Result<Vec<SignalHistoryRow>, Report<StorageError>>> {
        Box::pin(async move {
            #[allow(clippy::type_complexity)]
            let rows: Vec<SignalHistoryRowTuple> = sqlx::query_as(
                "SELECT id, chat_id, symbol, timeframe, signal, confidence, entries_json, \
                 take_profits_json, stop_loss, generated_at, outcome, actual_return_pct, outcome_at \
                 FROM signal_history WHERE outcome = 'pending'",
            )
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            Ok(rows.into_iter().map(map_signal_row).collect())
        })
    }

    fn get_preference(
        &self,
        chat_id: i64,
        key: &str,
    ) -> BoxFuture<'_, Result<Option<String>, Report<StorageError>>> {
        let key = key.to_string();
        Box::pin(async move {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT value FROM user_preferences WHERE chat_id = ? AND key = ?",
            )
            .bind(chat_id)
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;
            Ok(row.map(|(value,)| value))
        })
    }

    fn set_preference(
        &self,
        chat_id: i64,
        key: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO user_preferences (chat_id, key, value) VALUES (?, ?, ?) \
                 ON CONFLICT(chat_id, key) DO UPDATE SET value = excluded.value",
            )
            .bind(chat_id)
            .bind(&key)
            .bind(&value)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn record_tier_event(
        &self,
        event: &TierChange,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let event = event.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO subscription_history \
                 (chat_id, tier, action, duration_days, payment_amount, payment_method, notes) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.chat_id)
            .bind(event.tier.as_str())
            .bind(&event.action)
            .bind(event.duration_days)
            .bind(event.payment_amount)
            .bind(&event.payment_method)
            .bind(&event.notes)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }
}

#[allow(clippy::type_complexity)]
type SignalHistoryRowTuple = (
    i64,
    i64,
    String,
    String,
    String,
    f64,
    String,
    String,
    f64,
    String,
    String,
    Option<f64>,
    Option<String>,
);

fn map_alert_row((id, chat_id, symbol, direction, target_price, triggered): (i64, i64, String, String, f64, i64)) -> PriceAlert {
    PriceAlert {
        id,
        chat_id,
        symbol,
        direction: AlertDirection::from_str(&direction).unwrap_or(AlertDirection::Above),
        target_price,
        triggered: triggered != 0,
    }
}

fn map_signal_row(row: SignalHistoryRowTuple) -> SignalHistoryRow {
    let (
        id,
        chat_id,
        symbol,
        timeframe,
        signal,
        confidence,
        entries_json,
        take_profits_json,
        stop_loss,
        generated_at,
        outcome,
        actual_return_pct,
        outcome_at,
    ) = row;
    SignalHistoryRow {
        id,
        chat_id,
        symbol,
        timeframe: TimeFrame::from_str(&timeframe).unwrap_or(TimeFrame::Hour4),
        signal: crate::model::PlanSignal::from_str(&signal).unwrap_or(crate::model::PlanSignal::Hold),
        confidence,
        entries_json,
        take_profits_json,
        stop_loss,
        generated_at: parse_time_utc(&generated_at),
        outcome: SignalOutcome::from_str(&outcome).unwrap_or(SignalOutcome::Pending),
        actual_return_pct,
        outcome_at: outcome_at.map(|s| parse_time_utc(&s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanSignal;

    async fn in_memory_storage() -> SqliteStorage {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteStorage { pool }
    }

    #[tokio::test]
    async fn upsert_and_get_user() {
        let storage = in_memory_storage().await;
        let user = User {
            chat_id: 1,
            tier: Tier::Premium,
            enabled: true,
            tier_expires_at: None,
            default_exchange: ExchangeKind::Bybit,
            market_type: MarketType::Futures,
        };
        storage.upsert_user(&user).await.unwrap();

        let fetched = storage.get_user(1).await.unwrap().unwrap();
        assert_eq!(fetched.tier, Tier::Premium);
        assert_eq!(fetched.default_exchange, ExchangeKind::Bybit);
    }

    #[tokio::test]
    async fn subscription_add_is_idempotent() {
        let storage = in_memory_storage().await;
        let sub = Subscription {
            chat_id: 1,
            symbol: "BTCUSDT".into(),
            timeframe: TimeFrame::Hour1,
        };
        storage.add_subscription(&sub).await.unwrap();
        storage.add_subscription(&sub).await.unwrap();

        let subs = storage.list_subscriptions(1).await.unwrap();
        assert_eq!(subs.len(), 1);
    }

    #[tokio::test]
    async fn subscription_remove() {
        let storage = in_memory_storage().await;
        let sub = Subscription {
            chat_id: 1,
            symbol: "BTCUSDT".into(),
            timeframe: TimeFrame::Hour1,
        };
        storage.add_subscription(&sub).await.unwrap();
        storage
            .remove_subscription(1, "BTCUSDT", TimeFrame::Hour1)
            .await
            .unwrap();
        assert!(storage.list_subscriptions(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn alert_lifecycle() {
        let storage = in_memory_storage().await;
        let alert = PriceAlert {
            id: 0,
            chat_id: 1,
            symbol: "ETHUSDT".into(),
            direction: AlertDirection::Above,
            target_price: 3000.0,
            triggered: false,
        };
        let id = storage.add_alert(&alert).await.unwrap();
        assert_eq!(storage.active_alerts().await.unwrap().len(), 1);

        assert!(storage.mark_alert_triggered(id).await.unwrap());
        assert_eq!(storage.active_alerts().await.unwrap().len(), 0);
        assert_eq!(storage.list_alerts(1).await.unwrap().len(), 1);

        // a second claim attempt on an already-triggered alert is a no-op
        assert!(!storage.mark_alert_triggered(id).await.unwrap());

        storage.reset_alert_triggered(id).await.unwrap();
        assert_eq!(storage.active_alerts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn signal_history_round_trip() {
        let storage = in_memory_storage().await;
        let row = SignalHistoryRow {
            id: 0,
            chat_id: 1,
            symbol: "BTCUSDT".into(),
            timeframe: TimeFrame::Hour4,
            signal: PlanSignal::Buy,
            confidence: 0.72,
            entries_json: "[100.0]".into(),
            take_profits_json: "[105.0]".into(),
            stop_loss: 97.0,
            generated_at: Utc::now(),
            outcome: SignalOutcome::Pending,
            actual_return_pct: None,
            outcome_at: None,
        };
        let id = storage.record_signal(&row).await.unwrap();
        assert_eq!(storage.pending_signals().await.unwrap().len(), 1);

        storage
            .update_signal_outcome(id, SignalOutcome::Won, 4.2, Utc::now())
            .await
            .unwrap();

        assert!(storage.pending_signals().await.unwrap().is_empty());
        let history = storage.signal_history(1, 10).await.unwrap();
        assert_eq!(history[0].outcome, SignalOutcome::Won);
        assert_eq!(history[0].actual_return_pct, Some(4.2));
    }

    #[tokio::test]
    async fn screening_schedule_upsert_and_last_run() {
        let storage = in_memory_storage().await;
        let schedule = ScreeningSchedule {
            chat_id: 1,
            timeframe: TimeFrame::Hour4,
            interval_minutes: 240,
            min_score: 65.0,
            enabled: true,
            last_run: None,
        };
        storage.upsert_screening_schedule(&schedule).await.unwrap();
        assert_eq!(storage.list_screening_schedules().await.unwrap().len(), 1);

        let now = Utc::now();
        storage
            .update_screening_last_run(1, TimeFrame::Hour4, now)
            .await
            .unwrap();
        let schedules = storage.list_screening_schedules().await.unwrap();
        assert!(schedules[0].last_run.is_some());
    }
}
