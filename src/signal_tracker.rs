use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::Report;

use crate::error::StorageError;
use crate::model::{SignalHistoryRow, SignalOutcome, TimeFrame};
use crate::storage::Storage;

/// Aggregated win/loss statistics over a set of signals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalStats {
    pub total_signals: usize,
    pub wins: usize,
    pub losses: usize,
    pub breakeven: usize,
    pub pending: usize,
    pub win_rate: f64,
    pub avg_confidence: f64,
    pub avg_win_confidence: f64,
    pub avg_loss_confidence: f64,
}

/// Sort field for `best`/`worst` queries.
#[derive(Debug, Clone, Copy)]
pub enum RankBy {
    Confidence,
    ActualReturn,
}

/// Records signals and resolves their outcomes, and answers read queries
/// over a chat's signal history. A thin layer over `Storage` — the
/// aggregation logic below operates on rows already fetched, since the
/// persistence trait only exposes a per-chat signal window.
pub struct SignalTracker {
    storage: Arc<dyn Storage>,
}

impl SignalTracker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn record(&self, row: &SignalHistoryRow) -> Result<i64, Report<StorageError>> {
        self.storage.record_signal(row).await
    }

    pub async fn update_outcome(
        &self,
        id: i64,
        outcome: SignalOutcome,
        actual_return_pct: f64,
        at: DateTime<Utc>,
    ) -> Result<(), Report<StorageError>> {
        self.storage.update_signal_outcome(id, outcome, actual_return_pct, at).await
    }

    /// Full history for a chat, most recent first, optionally narrowed to a
    /// symbol and/or timeframe.
    pub async fn history(
        &self,
        chat_id: i64,
        symbol: Option<&str>,
        timeframe: Option<TimeFrame>,
        limit: usize,
    ) -> Result<Vec<SignalHistoryRow>, Report<StorageError>> {
        let rows = self.storage.signal_history(chat_id, limit).await?;
        Ok(filter_rows(rows, symbol, timeframe))
    }

    pub async fn by_symbol(
        &self,
        chat_id: i64,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<SignalHistoryRow>, Report<StorageError>> {
        self.history(chat_id, Some(symbol), None, limit).await
    }

    pub async fn by_timeframe(
        &self,
        chat_id: i64,
        timeframe: TimeFrame,
        limit: usize,
    ) -> Result<Vec<SignalHistoryRow>, Report<StorageError>> {
        self.history(chat_id, None, Some(timeframe), limit).await
    }

    pub async fn stats(
        &self,
        chat_id: i64,
        symbol: Option<&str>,
        timeframe: Option<TimeFrame>,
        days: i64,
    ) -> Result<SignalStats, Report<StorageError>> {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let rows = self.storage.signal_history(chat_id, usize::MAX).await?;
        let rows: Vec<_> = filter_rows(rows, symbol, timeframe)
            .into_iter()
            .filter(|r| r.generated_at >= cutoff)
            .collect();
        Ok(compute_stats(&rows))
    }

    pub async fn best(
        &self,
        chat_id: i64,
        rank_by: RankBy,
        limit: usize,
    ) -> Result<Vec<SignalHistoryRow>, Report<StorageError>> {
        let rows = self.storage.signal_history(chat_id, usize::MAX).await?;
        Ok(rank_resolved(rows, rank_by, limit, true))
    }

    pub async fn worst(
        &self,
        chat_id: i64,
        rank_by: RankBy,
        limit: usize,
    ) -> Result<Vec<SignalHistoryRow>, Report<StorageError>> {
        let rows = self.storage.signal_history(chat_id, usize::MAX).await?;
        Ok(rank_resolved(rows, rank_by, limit, false))
    }
}

fn filter_rows(
    rows: Vec<SignalHistoryRow>,
    symbol: Option<&str>,
    timeframe: Option<TimeFrame>,
) -> Vec<SignalHistoryRow> {
    rows.into_iter()
        .filter(|r| symbol.map(|s| r.symbol.eq_ignore_ascii_case(s)).unwrap_or(true))
        .filter(|r| timeframe.map(|tf| r.timeframe == tf).unwrap_or(true))
        .collect()
}

/// Win rate is wins / (wins + losses + breakeven) * 100 — pending signals
/// are excluded from the denominator, matching the resolved-only reading.
fn compute_stats(rows: &[SignalHistoryRow]) -> SignalStats {
    let total_signals = rows.len();
    let wins = rows.iter().filter(|r| r.outcome == SignalOutcome::Won).count();
    let losses = rows.iter().filter(|r| r.outcome == SignalOutcome::Lost).count();
    let breakeven = rows.iter().filter(|r| r.outcome == SignalOutcome::Breakeven).count();
    let pending = rows.iter().filter(|r| r.outcome == SignalOutcome::Pending).count();

    let completed = wins + losses + breakeven;
    let win_rate = if completed > 0 {
        wins as f64 / completed as f64 * 100.0
    } else {
        0.0
    };

    let avg = |rows: &[&SignalHistoryRow]| {
        if rows.is_empty() {
            0.0
        } else {
            rows.iter().map(|r| r.confidence).sum::<f64>() / rows.len() as f64
        }
    };
    let avg_confidence = avg(&rows.iter().collect::<Vec<_>>());
    let win_rows: Vec<_> = rows.iter().filter(|r| r.outcome == SignalOutcome::Won).collect();
    let loss_rows: Vec<_> = rows.iter().filter(|r| r.outcome == SignalOutcome::Lost).collect();

    SignalStats {
        total_signals,
        wins,
        losses,
        breakeven,
        pending,
        win_rate,
        avg_confidence,
        avg_win_confidence: avg(&win_rows),
        avg_loss_confidence: avg(&loss_rows),
    }
}

fn rank_resolved(
    rows: Vec<SignalHistoryRow>,
    rank_by: RankBy,
    limit: usize,
    descending: bool,
) -> Vec<SignalHistoryRow> {
    let mut resolved: Vec<_> = rows
        .into_iter()
        .filter(|r| r.outcome != SignalOutcome::Pending)
        .collect();

    resolved.sort_by(|a, b| {
        let (ka, kb) = match rank_by {
            RankBy::Confidence => (a.confidence, b.confidence),
            RankBy::ActualReturn => (a.actual_return_pct.unwrap_or(0.0), b.actual_return_pct.unwrap_or(0.0)),
        };
        if descending {
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        } else {
            ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
        }
    });
    resolved.truncate(limit);
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanSignal;
    use crate::storage::sqlite::SqliteStorage;

    fn row(id: i64, symbol: &str, tf: TimeFrame, outcome: SignalOutcome, confidence: f64, ret: Option<f64>) -> SignalHistoryRow {
        SignalHistoryRow {
            id,
            chat_id: 1,
            symbol: symbol.to_owned(),
            timeframe: tf,
            signal: PlanSignal::Buy,
            confidence,
            entries_json: "[]".into(),
            take_profits_json: "[]".into(),
            stop_loss: 100.0,
            generated_at: Utc::now(),
            outcome,
            actual_return_pct: ret,
            outcome_at: None,
        }
    }

    #[test]
    fn compute_stats_win_rate_excludes_pending() {
        let rows = vec![
            row(1, "BTCUSDT", TimeFrame::Hour1, SignalOutcome::Won, 0.8, Some(3.0)),
            row(2, "BTCUSDT", TimeFrame::Hour1, SignalOutcome::Lost, 0.6, Some(-1.0)),
            row(3, "BTCUSDT", TimeFrame::Hour1, SignalOutcome::Pending, 0.7, None),
        ];
        let stats = compute_stats(&rows);
        assert_eq!(stats.total_signals, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.win_rate, 50.0);
    }

    #[test]
    fn rank_resolved_excludes_pending_and_sorts_descending() {
        let rows = vec![
            row(1, "BTCUSDT", TimeFrame::Hour1, SignalOutcome::Won, 0.9, Some(5.0)),
            row(2, "ETHUSDT", TimeFrame::Hour1, SignalOutcome::Lost, 0.4, Some(-2.0)),
            row(3, "SOLUSDT", TimeFrame::Hour1, SignalOutcome::Pending, 0.95, None),
        ];
        let best = rank_resolved(rows, RankBy::Confidence, 10, true);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].id, 1);
    }

    #[test]
    fn filter_rows_narrows_by_symbol_and_timeframe() {
        let rows = vec![
            row(1, "BTCUSDT", TimeFrame::Hour1, SignalOutcome::Won, 0.8, Some(1.0)),
            row(2, "ETHUSDT", TimeFrame::Hour4, SignalOutcome::Lost, 0.5, Some(-1.0)),
        ];
        let filtered = filter_rows(rows, Some("btcusdt"), None);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn record_and_update_round_trip_through_storage() {
        let path = std::env::temp_dir().join(format!("signal-tracker-test-{}.db", uuid::Uuid::new_v4()));
        let storage = Arc::new(SqliteStorage::open(&path).await.unwrap());
        let tracker = SignalTracker::new(storage);
        let new_row = row(0, "BTCUSDT", TimeFrame::Hour1, SignalOutcome::Pending, 0.7, None);
        let id = tracker.record(&new_row).await.unwrap();
        tracker
            .update_outcome(id, SignalOutcome::Won, 4.2, Utc::now())
            .await
            .unwrap();
        let history = tracker.history(1, None, None, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, SignalOutcome::Won);
        std::fs::remove_file(&path).ok();
    }
}
