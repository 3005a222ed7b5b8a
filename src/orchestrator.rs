use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Timelike, Utc};
use error_stack::Report;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{MarketDataError, NotifyError, OrchestratorError, PlanError};
use crate::indicator::Indicator;
use crate::indicator::macd::Macd;
use crate::indicator::rsi::Rsi;
use crate::indicator::trend::trend_summary;
use crate::mdf::MarketDataFetcher;
use crate::model::{AlertDirection, Candle, PlanSignal, SignalHistoryRow, TimeFrame, Trend};
use crate::notifier::Notifier;
use crate::plan::{self, PlanProvider};
use crate::screener::{self, QuickScoreProvider};
use crate::signal_tracker::SignalTracker;
use crate::storage::Storage;
use crate::store::SubscriptionStore;

/// Unit of background work consumed by the worker pool. Ordered so `AlertCheck`
/// drains before `SignalCheck`, before `ScheduledScreening`, before `AutoPlan`.
#[derive(Debug, Clone)]
pub enum WorkItem {
    AlertCheck,
    SignalCheck { chat_id: i64 },
    ScheduledScreening { chat_id: i64, timeframe: TimeFrame, min_score: f64 },
    AutoPlan { chat_id: i64, timeframe: TimeFrame, symbols: Vec<String> },
}

impl WorkItem {
    fn priority(&self) -> u8 {
        match self {
            WorkItem::AlertCheck => 3,
            WorkItem::SignalCheck { .. } => 2,
            WorkItem::ScheduledScreening { .. } => 1,
            WorkItem::AutoPlan { .. } => 0,
        }
    }

    fn deadline(&self, config: &OrchestratorConfig) -> StdDuration {
        let secs = match self {
            WorkItem::AlertCheck | WorkItem::SignalCheck { .. } => config.work_item_deadline_secs,
            WorkItem::ScheduledScreening { .. } => config.work_item_deadline_secs * 3,
            WorkItem::AutoPlan { .. } => config.work_item_deadline_secs * 10,
        };
        StdDuration::from_secs(secs)
    }

    fn label(&self) -> &'static str {
        match self {
            WorkItem::AlertCheck => "alert_check",
            WorkItem::SignalCheck { .. } => "signal_check",
            WorkItem::ScheduledScreening { .. } => "scheduled_screening",
            WorkItem::AutoPlan { .. } => "auto_plan",
        }
    }
}

/// Entry in the priority queue. Sequence breaks ties FIFO within the same
/// priority band, since `BinaryHeap` gives no ordering guarantee otherwise.
struct QueueEntry {
    item: WorkItem,
    priority: u8,
    sequence: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Bounded, multi-producer multi-consumer work queue with soft priority.
/// A push beyond `capacity` is dropped rather than blocking the scheduler
/// tick — a full queue means the tick skips rather than piling up a deeper
/// backlog.
struct WorkQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    capacity: usize,
    next_sequence: Mutex<u64>,
}

impl WorkQueue {
    fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            capacity,
            next_sequence: Mutex::new(0),
        }
    }

    async fn push(&self, item: WorkItem) -> bool {
        let mut heap = self.heap.lock().await;
        if heap.len() >= self.capacity {
            warn!(item = item.label(), "work queue full, dropping item for this tick");
            return false;
        }
        let mut seq = self.next_sequence.lock().await;
        *seq += 1;
        heap.push(QueueEntry {
            priority: item.priority(),
            item,
            sequence: *seq,
        });
        drop(seq);
        drop(heap);
        self.notify.notify_one();
        true
    }

    async fn pop(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            {
                let mut heap = self.heap.lock().await;
                if let Some(entry) = heap.pop() {
                    return Some(entry.item);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

/// Last notified actionable signal per `(chat_id, symbol)`, used to suppress
/// repeat notifications for an unchanged signal. In-process only: after a
/// restart the next detection re-notifies, which is acceptable.
struct SignalMemory {
    entries: Mutex<HashMap<(i64, String), (PlanSignal, DateTime<Utc>)>>,
    ttl: chrono::Duration,
}

impl SignalMemory {
    fn new(ttl_minutes: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::minutes(ttl_minutes),
        }
    }

    /// Returns true (and records `signal`) only if `signal` is actionable and
    /// differs from the last remembered signal for this key.
    async fn should_notify(&self, chat_id: i64, symbol: &str, signal: PlanSignal) -> bool {
        if !matches!(signal, PlanSignal::Buy | PlanSignal::Sell) {
            return false;
        }
        let key = (chat_id, symbol.to_owned());
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        entries.retain(|_, (_, at)| now.signed_duration_since(*at) < self.ttl);
        match entries.get(&key) {
            Some((last, _)) if *last == signal => {
                // Unchanged signal: refresh the timestamp so the TTL measures
                // time since last *seen*, not time since last *change* — an
                // identical signal checked every tick should never age out.
                entries.insert(key, (signal, now));
                false
            }
            _ => {
                entries.insert(key, (signal, now));
                true
            }
        }
    }
}

/// Ticks a minute-granularity scheduler, fans work out across a bounded
/// worker pool, and coordinates the MDF/PP/SC pipelines behind it. Owns the
/// transient `SignalMemory` and the work queue; persistent state lives in
/// the subscription store and signal tracker.
pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    mdf: Arc<MarketDataFetcher>,
    notifier: Arc<dyn Notifier>,
    plan_provider: Arc<dyn PlanProvider>,
    quick_score: Option<Arc<dyn QuickScoreProvider>>,
    store: Arc<SubscriptionStore>,
    tracker: Arc<SignalTracker>,
    config: OrchestratorConfig,
    queue: Arc<WorkQueue>,
    signal_memory: Arc<SignalMemory>,
    last_signal_check: Mutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        mdf: Arc<MarketDataFetcher>,
        notifier: Arc<dyn Notifier>,
        plan_provider: Arc<dyn PlanProvider>,
        quick_score: Option<Arc<dyn QuickScoreProvider>>,
        store: Arc<SubscriptionStore>,
        tracker: Arc<SignalTracker>,
        config: OrchestratorConfig,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.queue_capacity));
        let signal_memory = Arc::new(SignalMemory::new(config.signal_memory_ttl_minutes));
        Self {
            storage,
            mdf,
            notifier,
            plan_provider,
            quick_score,
            store,
            tracker,
            config,
            queue,
            signal_memory,
            last_signal_check: Mutex::new(None),
        }
    }

    /// Runs the tick loop and worker pool until `cancel` fires. Returns once
    /// every worker has drained and exited.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut workers = Vec::with_capacity(self.config.worker_pool_size);
        for id in 0..self.config.worker_pool_size {
            let orchestrator = Arc::clone(&self);
            let worker_cancel = cancel.clone();
            workers.push(tokio::spawn(async move {
                orchestrator.worker_loop(id, worker_cancel).await;
            }));
        }

        let tick_orchestrator = Arc::clone(&self);
        let tick_cancel = cancel.clone();
        let ticker = tokio::spawn(async move {
            tick_orchestrator.tick_loop(tick_cancel).await;
        });

        let _ = ticker.await;
        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn tick_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(self.config.tick_interval_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = cancel.cancelled() => {
                    info!("tick loop cancelled");
                    return;
                }
            }
        }
    }

    async fn tick(&self) {
        self.queue.push(WorkItem::AlertCheck).await;

        let signal_interval = chrono::Duration::minutes(self.config.signal_check_interval_minutes);
        let mut last = self.last_signal_check.lock().await;
        let now = Utc::now();
        let due = last.map(|at| now.signed_duration_since(at) >= signal_interval).unwrap_or(true);
        if due {
            *last = Some(now);
            drop(last);
            match self.storage.all_subscriptions().await {
                Ok(subs) => {
                    let mut chat_ids: Vec<i64> = subs.iter().map(|s| s.chat_id).collect();
                    chat_ids.sort_unstable();
                    chat_ids.dedup();
                    for chat_id in chat_ids {
                        self.queue.push(WorkItem::SignalCheck { chat_id }).await;
                    }
                }
                Err(e) => warn!(error = ?e, "failed to list subscriptions for signal check tick"),
            }
        } else {
            drop(last);
        }

        match self.storage.list_screening_schedules().await {
            Ok(schedules) => {
                for schedule in schedules {
                    if !schedule.enabled {
                        continue;
                    }
                    let effective_interval = if in_active_hours(Utc::now()) {
                        schedule.interval_minutes
                    } else {
                        schedule.interval_minutes * 2
                    };
                    let due = schedule
                        .last_run
                        .map(|at| Utc::now().signed_duration_since(at) >= chrono::Duration::minutes(effective_interval))
                        .unwrap_or(true);
                    if due {
                        self.queue
                            .push(WorkItem::ScheduledScreening {
                                chat_id: schedule.chat_id,
                                timeframe: schedule.timeframe,
                                min_score: schedule.min_score,
                            })
                            .await;
                    }
                }
            }
            Err(e) => warn!(error = ?e, "failed to list screening schedules"),
        }
    }

    async fn worker_loop(&self, id: usize, cancel: CancellationToken) {
        while let Some(item) = self.queue.pop(&cancel).await {
            let label = item.label();
            let deadline = item.deadline(&self.config);
            debug!(worker = id, item = label, "dispatching work item");
            match tokio::time::timeout(deadline, self.dispatch(item)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(worker = id, item = label, error = ?e, "work item failed"),
                Err(_) => warn!(worker = id, item = label, "work item abandoned past its deadline"),
            }
        }
    }

    async fn dispatch(&self, item: WorkItem) -> Result<(), Report<OrchestratorError>> {
        match item {
            WorkItem::AlertCheck => self.handle_alert_check().await,
            WorkItem::SignalCheck { chat_id } => self.handle_signal_check(chat_id).await,
            WorkItem::ScheduledScreening { chat_id, timeframe, min_score } => {
                self.handle_scheduled_screening(chat_id, timeframe, min_score).await
            }
            WorkItem::AutoPlan { chat_id, timeframe, symbols } => {
                self.handle_auto_plan(chat_id, timeframe, symbols).await
            }
        }
    }

    async fn handle_alert_check(&self) -> Result<(), Report<OrchestratorError>> {
        let alerts = match self.storage.active_alerts().await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = ?e, "failed to load active alerts");
                return Ok(());
            }
        };

        for alert in alerts {
            let user = match self.storage.get_user(alert.chat_id).await {
                Ok(Some(u)) if u.enabled => u,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = ?e, chat_id = alert.chat_id, "failed to load user for alert");
                    continue;
                }
            };

            let candles = match fetch_with_retry(
                &self.mdf,
                user.default_exchange,
                user.market_type,
                &alert.symbol,
                TimeFrame::Min1,
                2,
                &self.config,
            )
            .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = ?e, symbol = alert.symbol, "alert candle fetch failed");
                    continue;
                }
            };
            let Some(last) = candles.last() else { continue };

            let crossed = match alert.direction {
                AlertDirection::Above => last.close >= alert.target_price,
                AlertDirection::Below => last.close <= alert.target_price,
            };
            if !crossed {
                continue;
            }

            // Claim the alert atomically before sending: two workers racing
            // on the same alert both see crossed=true, but only one flips
            // triggered=false -> true and gets to notify.
            let claimed = match self.storage.mark_alert_triggered(alert.id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(error = ?e, alert_id = alert.id, "failed to claim alert for triggering");
                    continue;
                }
            };
            if !claimed {
                debug!(alert_id = alert.id, "alert already claimed by a concurrent check, skipping notify");
                continue;
            }

            let text = format!(
                "{} crossed {} your target {:.4} (now {:.4})",
                alert.symbol,
                alert.direction.as_str(),
                alert.target_price,
                last.close
            );
            if let Err(e) = self.notifier.send(alert.chat_id, &text, false).await {
                // send failed after claiming: release the claim so the next
                // tick retries instead of silently dropping the alert.
                warn!(error = ?e, alert_id = alert.id, "alert notification send failed");
                if let Err(e) = self.storage.reset_alert_triggered(alert.id).await {
                    warn!(error = ?e, alert_id = alert.id, "failed to reset alert after failed send");
                }
            }
        }
        Ok(())
    }

    async fn handle_signal_check(&self, chat_id: i64) -> Result<(), Report<OrchestratorError>> {
        let user = match self.storage.get_user(chat_id).await {
            Ok(Some(u)) if u.enabled => u,
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(error = ?e, chat_id, "failed to load user for signal check");
                return Ok(());
            }
        };

        let subscriptions = match self.store.subscriptions(chat_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, chat_id, "failed to load subscriptions for signal check");
                return Ok(());
            }
        };

        for sub in subscriptions {
            let candles = match fetch_with_retry(
                &self.mdf,
                user.default_exchange,
                user.market_type,
                &sub.symbol,
                TimeFrame::Hour4,
                100,
                &self.config,
            )
            .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = ?e, symbol = sub.symbol, "signal check candle fetch failed");
                    continue;
                }
            };

            let Some(signal) = derive_three_signal_sum(&candles) else {
                continue;
            };

            if self.signal_memory.should_notify(chat_id, &sub.symbol, signal).await {
                let text = format!(
                    "{} signal changed to {} on {}",
                    sub.symbol,
                    signal.as_str(),
                    sub.timeframe
                );
                if let Err(e) = self.notifier.send(chat_id, &text, false).await {
                    warn!(error = ?e, chat_id, symbol = sub.symbol, "signal notification send failed");
                }
            }
        }
        Ok(())
    }

    async fn handle_scheduled_screening(
        &self,
        chat_id: i64,
        timeframe: TimeFrame,
        min_score: f64,
    ) -> Result<(), Report<OrchestratorError>> {
        let user = match self.storage.get_user(chat_id).await {
            Ok(Some(u)) if u.enabled => u,
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(error = ?e, chat_id, "failed to load user for screening");
                return Ok(());
            }
        };

        let quick_score_ref: Option<&dyn QuickScoreProvider> = self.quick_score.as_deref();
        let (results, summary) = screener::screen_market(
            &self.mdf,
            user.default_exchange,
            user.market_type,
            quick_score_ref,
            screener::TOP_USDT_PAIRS,
            timeframe,
            10,
        )
        .await;

        let survivors: Vec<_> = results.into_iter().filter(|r| r.score >= min_score).collect();

        if let Err(e) = self.storage.update_screening_last_run(chat_id, timeframe, Utc::now()).await {
            warn!(error = ?e, chat_id, "failed to record screening last_run");
        }

        if survivors.is_empty() {
            return Ok(());
        }

        let summary_text = format!(
            "Screening ({timeframe}): {} candidates, avg {:.1}, top {:.1} ({} bullish / {} bearish / {} neutral)",
            summary.total, summary.avg_score, summary.top_score, summary.bullish, summary.bearish, summary.neutral
        );
        let listing = survivors
            .iter()
            .map(|r| format!("{} — {:.1}", r.symbol, r.score))
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(e) = self.notifier.send(chat_id, &format!("{summary_text}\n{listing}"), false).await {
            warn!(error = ?e, chat_id, "screening summary send failed");
        }

        let top_k = 5;
        let symbols: Vec<String> = survivors.into_iter().take(top_k).map(|r| r.symbol).collect();
        self.queue.push(WorkItem::AutoPlan { chat_id, timeframe, symbols }).await;

        Ok(())
    }

    async fn handle_auto_plan(
        &self,
        chat_id: i64,
        timeframe: TimeFrame,
        symbols: Vec<String>,
    ) -> Result<(), Report<OrchestratorError>> {
        let user = match self.storage.get_user(chat_id).await {
            Ok(Some(u)) if u.enabled => u,
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!(error = ?e, chat_id, "failed to load user for auto plan");
                return Ok(());
            }
        };

        for symbol in symbols {
            let candles = match fetch_with_retry(
                &self.mdf,
                user.default_exchange,
                user.market_type,
                &symbol,
                timeframe,
                100,
                &self.config,
            )
            .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = ?e, symbol, "auto plan candle fetch failed");
                    continue;
                }
            };

            let mtf = plan::collect_mtf_context(&self.mdf, user.default_exchange, user.market_type, &symbol, timeframe).await;

            let trading_plan = match self
                .plan_provider
                .generate_plan(&symbol, timeframe, user.default_exchange, user.market_type, &candles, &mtf)
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    // PP failures are never retried; degrade to HOLD and move on.
                    warn!(error = ?e, symbol, "plan generation failed, treating as hold");
                    continue;
                }
            };

            // actionability filter: HOLD/WAIT plans are dropped silently
            if !matches!(trading_plan.signal, PlanSignal::Buy | PlanSignal::Sell | PlanSignal::ScalpLong | PlanSignal::ScalpShort) {
                continue;
            }

            let text = format_plan_notification(&trading_plan);
            if let Err(e) = self.notifier.send(chat_id, &text, true).await {
                warn!(error = ?e, chat_id, symbol, "plan notification send failed");
            }

            let row = SignalHistoryRow {
                id: 0,
                chat_id,
                symbol: trading_plan.symbol.clone(),
                timeframe: trading_plan.timeframe,
                signal: trading_plan.signal,
                confidence: trading_plan.confidence,
                entries_json: serde_json::to_string(&trading_plan.entries).unwrap_or_default(),
                take_profits_json: serde_json::to_string(&trading_plan.take_profits).unwrap_or_default(),
                stop_loss: trading_plan.stop_loss,
                generated_at: trading_plan.generated_at,
                outcome: crate::model::SignalOutcome::Pending,
                actual_return_pct: None,
                outcome_at: None,
            };
            if let Err(e) = self.tracker.record(&row).await {
                warn!(error = ?e, symbol, "failed to record signal history");
            }
        }
        Ok(())
    }
}

fn format_plan_notification(plan: &crate::model::TradingPlan) -> String {
    format!(
        "{} {} {} (confidence {:.0}%)\n{}\nstop loss: {:.4} — {}",
        plan.symbol,
        plan.signal.as_str(),
        plan.timeframe,
        plan.confidence * 100.0,
        plan.reason,
        plan.stop_loss,
        plan.stop_loss_reason,
    )
}

fn in_active_hours(now: DateTime<Utc>) -> bool {
    (8..16).contains(&now.hour())
}

/// Three-signal sum: trend (SMA stack), RSI zone, MACD histogram sign, each
/// contributing -1/0/+1. Sum >= 2 is BUY, <= -2 is SELL, otherwise HOLD.
/// Returns `None` when there isn't enough history to evaluate.
fn derive_three_signal_sum(candles: &[Candle]) -> Option<PlanSignal> {
    if candles.len() < 50 {
        return None;
    }

    let trend = trend_summary(candles, 20, 50);
    let trend_vote = match trend {
        Trend::Bullish => 1,
        Trend::Bearish => -1,
        Trend::Sideways => 0,
    };

    let rsi = Rsi::new(14).ok()?.calculate(candles).ok()?.last().copied()?;
    let rsi_vote = if rsi < 30.0 {
        1
    } else if rsi > 70.0 {
        -1
    } else {
        0
    };

    let macd_hist = Macd::new(12, 26, 9).ok()?.calculate(candles).ok()?.last().copied()?;
    let macd_vote = if macd_hist > 0.0 { 1 } else { -1 };

    let sum = trend_vote + rsi_vote + macd_vote;
    Some(if sum >= 2 {
        PlanSignal::Buy
    } else if sum <= -2 {
        PlanSignal::Sell
    } else {
        PlanSignal::Hold
    })
}

/// Retries an MDF fetch up to `config.max_retries` times with exponential
/// backoff (base `backoff_base_ms`, capped at `backoff_max_ms`) before giving
/// up. MDF already falls back to the alternate exchange and stale cache
/// internally, so a retry here covers transient failures of that whole path.
/// Never retries a failure rooted in a non-retryable exchange error (unknown
/// symbol, response parse failure) or outright cache exhaustion — those
/// won't resolve themselves on a second attempt.
async fn fetch_with_retry(
    mdf: &MarketDataFetcher,
    exchange: crate::model::ExchangeKind,
    market: crate::model::MarketType,
    symbol: &str,
    timeframe: TimeFrame,
    limit: usize,
    config: &OrchestratorConfig,
) -> Result<Vec<Candle>, Report<MarketDataError>> {
    let mut attempt = 0;
    loop {
        match mdf.fetch_candles(exchange, market, symbol, timeframe, limit).await {
            Ok(candles) => return Ok(candles),
            Err(e) if !e.current_context().is_retryable() => return Err(e),
            Err(e) if attempt >= config.max_retries => return Err(e),
            Err(_) => {
                let backoff_ms = (config.backoff_base_ms.saturating_mul(1 << attempt)).min(config.backoff_max_ms);
                tokio::time::sleep(StdDuration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Never propagates a `PlanError` to the caller — callers treat a failed
/// generation as an implicit HOLD per `hold_plan`.
#[allow(dead_code)]
fn degrade_to_hold(symbol: &str, timeframe: TimeFrame, current_price: f64, err: &Report<PlanError>) -> crate::model::TradingPlan {
    warn!(symbol, error = ?err, "plan provider failed, degrading to hold");
    plan::hold_plan(symbol, timeframe, current_price, "plan generation failed")
}

#[allow(dead_code)]
fn notify_error_is_transient(err: &Report<NotifyError>) -> bool {
    matches!(err.current_context(), NotifyError::SendFailed { .. })
}
