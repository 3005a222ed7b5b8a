use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use error_stack::{Report, ResultExt, bail};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::PlanError;
use crate::indicator::adx::Adx;
use crate::indicator::levels::{resistance_levels, support_levels};
use crate::indicator::macd::Macd;
use crate::indicator::rsi::Rsi;
use crate::indicator::trend::trend_summary;
use crate::indicator::volume::VolumeMA;
use crate::indicator::Indicator;
use crate::mdf::MarketDataFetcher;
use crate::model::{
    Candle, ExchangeKind, MarketType, PlanEntry, PlanSignal, TakeProfit, TimeFrame, TradingPlan,
    Trend,
};

const NEAR_CLUSTER_PCT: f64 = 0.5;
const SCALP_NEAR_PCT: f64 = 1.0;
const MIN_RISK_REWARD: f64 = 2.0;

/// Turns a candle window plus multi-timeframe context into a trading plan.
/// Implementations are single-call; the orchestrator owns retries.
pub trait PlanProvider: Send + Sync {
    fn generate_plan<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: TimeFrame,
        exchange: ExchangeKind,
        market: MarketType,
        candles: &'a [Candle],
        mtf: &'a [MtfSummary],
    ) -> BoxFuture<'a, Result<TradingPlan, Report<PlanError>>>;
}

/// Condensed view of a lower timeframe, used as confluence context.
#[derive(Debug, Clone)]
pub struct MtfSummary {
    pub timeframe: TimeFrame,
    pub trend: Trend,
    pub above_sma: bool,
    pub momentum: f64,
}

/// Local, deterministic precursor to the LLM call: indicators, quality
/// gates, and scalping eligibility. Shared by both plan providers so the
/// gate logic lives in exactly one place.
pub struct LocalAnalysis {
    pub current_price: f64,
    pub trend: Trend,
    pub rsi: f64,
    pub macd_hist: f64,
    pub adx: f64,
    pub resistance: Vec<f64>,
    pub support: Vec<f64>,
    pub day_high: f64,
    pub day_low: f64,
    pub volume_below_average: bool,
    pub quality_gate_passed: bool,
    pub scalp_eligible: bool,
    pub precision: usize,
}

/// Compute indicators and evaluate the quality gate and scalping-mode
/// conditions that drive prompt construction.
pub fn build_local_analysis(
    symbol: &str,
    candles: &[Candle],
) -> Result<LocalAnalysis, Report<PlanError>> {
    if candles.len() < 30 {
        bail!(PlanError::InsufficientData {
            symbol: symbol.to_owned(),
        });
    }

    let current_price = candles.last().unwrap().close;
    let trend = trend_summary(candles, 9, 21);

    let rsi = Rsi::new(14)
        .change_context(PlanError::PlanGenerationFailed {
            symbol: symbol.to_owned(),
            reason: "rsi setup".into(),
        })?
        .calculate(candles)
        .ok()
        .and_then(|v| v.last().copied())
        .unwrap_or(50.0);

    let macd_hist = Macd::new(12, 26, 9)
        .change_context(PlanError::PlanGenerationFailed {
            symbol: symbol.to_owned(),
            reason: "macd setup".into(),
        })?
        .calculate(candles)
        .ok()
        .and_then(|v| v.last().copied())
        .unwrap_or(0.0);

    let adx = Adx::new(14)
        .change_context(PlanError::PlanGenerationFailed {
            symbol: symbol.to_owned(),
            reason: "adx setup".into(),
        })?
        .calculate(candles)
        .unwrap_or_else(|_| vec![25.0])
        .last()
        .copied()
        .unwrap_or(25.0);

    let resistance = resistance_levels(candles, 5, 3).unwrap_or_default();
    let support = support_levels(candles, 5, 3).unwrap_or_default();

    let window = &candles[candles.len().saturating_sub(24)..];
    let day_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let day_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

    let volume_below_average = VolumeMA::new(20)
        .ok()
        .and_then(|ma| ma.calculate(candles).ok())
        .and_then(|v| v.last().copied())
        .map(|avg| candles.last().unwrap().volume < avg)
        .unwrap_or(false);

    let near_cluster = |levels: &[f64]| {
        levels
            .iter()
            .any(|&l| ((l - current_price).abs() / current_price) * 100.0 <= NEAR_CLUSTER_PCT)
    };
    let near_cluster_scalp = |levels: &[f64]| {
        levels
            .iter()
            .any(|&l| ((l - current_price).abs() / current_price) * 100.0 <= SCALP_NEAR_PCT)
    };

    let rsi_neutral = (40.0..=60.0).contains(&rsi);
    let quality_gate_passed =
        !(adx < 20.0 || rsi_neutral || volume_below_average || near_cluster(&resistance) || near_cluster(&support));

    let scalp_eligible =
        adx < 25.0 && rsi_neutral && (near_cluster_scalp(&resistance) || near_cluster_scalp(&support));

    let precision = if current_price >= 1000.0 {
        2
    } else if current_price >= 1.0 {
        4
    } else {
        6
    };

    Ok(LocalAnalysis {
        current_price,
        trend,
        rsi,
        macd_hist,
        adx,
        resistance,
        support,
        day_high,
        day_low,
        volume_below_average,
        quality_gate_passed,
        scalp_eligible,
        precision,
    })
}

/// Fetch and summarize the lower timeframes consulted for MTF confluence.
pub async fn collect_mtf_context(
    mdf: &MarketDataFetcher,
    exchange: ExchangeKind,
    market: MarketType,
    symbol: &str,
    timeframe: TimeFrame,
) -> Vec<MtfSummary> {
    let mut summaries = Vec::new();
    for &child in timeframe.mtf_children() {
        let candles = match mdf.fetch_candles(exchange, market, symbol, child, 60).await {
            Ok(c) if c.len() >= 20 => c,
            _ => continue,
        };
        let trend = trend_summary(&candles, 9, 21);
        let current = candles.last().unwrap().close;
        let sma_window = &candles[candles.len().saturating_sub(20)..];
        let sma = sma_window.iter().map(|c| c.close).sum::<f64>() / sma_window.len() as f64;
        let momentum = Macd::new(12, 26, 9)
            .ok()
            .and_then(|m| m.calculate(&candles).ok())
            .and_then(|v| v.last().copied())
            .unwrap_or(0.0);
        summaries.push(MtfSummary {
            timeframe: child,
            trend,
            above_sma: current >= sma,
            momentum,
        });
    }
    summaries
}

/// Reject a higher-timeframe-opposing signal: any MTF child trending against
/// `signal`'s side collapses the plan to WAIT per the confluence rule.
fn mtf_opposes(signal: PlanSignal, mtf: &[MtfSummary]) -> bool {
    if signal.is_bullish_side() {
        mtf.iter().any(|m| m.trend == Trend::Bearish)
    } else if signal.is_bearish_side() {
        mtf.iter().any(|m| m.trend == Trend::Bullish)
    } else {
        false
    }
}

/// A minimal, always-valid HOLD plan used whenever generation or
/// post-validation fails — never propagate an invalid plan to a subscriber.
pub fn hold_plan(symbol: &str, timeframe: TimeFrame, current_price: f64, reason: &str) -> TradingPlan {
    let now = Utc::now();
    TradingPlan {
        symbol: symbol.to_owned(),
        timeframe,
        generated_at: now,
        current_price,
        trend: Trend::Sideways,
        signal: PlanSignal::Hold,
        confidence: 0.0,
        reason: reason.to_owned(),
        entries: Vec::new(),
        take_profits: Vec::new(),
        stop_loss: current_price,
        stop_loss_reason: "no position".into(),
        risk_reward_ratio: 0.0,
        probability_of_success: 0.0,
        expected_return: 0.0,
        expires_at: now + chrono::Duration::hours(timeframe.validity_hours()),
    }
}

/// Post-validation per the direction invariants plus a minimum 1:2 R:R on
/// the first entry. Returns `Ok(plan)` unchanged when it passes, otherwise a
/// HOLD plan coercion.
fn validate_or_coerce(plan: TradingPlan, symbol: &str) -> TradingPlan {
    if !plan.signal.is_actionable() {
        return plan;
    }
    if !plan.satisfies_direction_invariants() {
        warn!(symbol, "plan failed direction invariants, coercing to HOLD");
        return hold_plan(symbol, plan.timeframe, plan.current_price, "failed post-validation");
    }
    let Some(first_entry) = plan.entries.first() else {
        return hold_plan(symbol, plan.timeframe, plan.current_price, "no entries");
    };
    let risk = (first_entry.level - plan.stop_loss).abs();
    let Some(first_tp) = plan.take_profits.first() else {
        return hold_plan(symbol, plan.timeframe, plan.current_price, "no take profits");
    };
    let reward = (first_tp.level - first_entry.level).abs();
    if risk <= 0.0 || reward / risk < MIN_RISK_REWARD {
        warn!(symbol, "plan failed minimum risk/reward, coercing to HOLD");
        return hold_plan(symbol, plan.timeframe, plan.current_price, "risk/reward below 1:2");
    }
    plan
}

/// LLM-backed implementation calling a DeepSeek-compatible chat completion
/// endpoint in JSON mode.
pub struct DeepSeekPlanProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    timeout: StdDuration,
    limiter: Arc<DefaultDirectRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct RawPlanResponse {
    #[serde(default)]
    signal: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    entries: Vec<RawEntry>,
    #[serde(default)]
    take_profits: Vec<RawTakeProfit>,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    stop_loss_reason: Option<String>,
    #[serde(default)]
    probability_of_success: Option<f64>,
    #[serde(default)]
    expected_return: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    level: f64,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default = "default_risk_score")]
    risk_score: u8,
}

fn default_weight() -> f64 {
    1.0
}

fn default_risk_score() -> u8 {
    3
}

#[derive(Debug, Deserialize)]
struct RawTakeProfit {
    level: f64,
    #[serde(default)]
    reward_ratio: f64,
    #[serde(default)]
    pct_gain: f64,
}

impl DeepSeekPlanProvider {
    pub fn new(config: &LlmConfig, limiter: Arc<DefaultDirectRateLimiter>) -> Result<Self, Report<PlanError>> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_default();
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.model.clone(),
            timeout: StdDuration::from_secs(config.timeout_secs),
            limiter,
        })
    }

    fn build_prompt(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        analysis: &LocalAnalysis,
        mtf: &[MtfSummary],
    ) -> String {
        let gate_note = if analysis.scalp_eligible {
            "Scalping mode is active: relax the quality gate and respond with SCALP_LONG or \
             SCALP_SHORT, tight stop (0.3-0.5%) and small take-profit (0.5-1.5%)."
        } else if !analysis.quality_gate_passed {
            "Quality gate failed (low ADX, neutral RSI, thin volume, or price pinned to a \
             cluster level): respond with HOLD unless conditions clearly override this."
        } else {
            "Quality gate passed: a directional BUY or SELL is permitted if supported by \
             the indicators below."
        };
        let mtf_note = if mtf.is_empty() {
            String::new()
        } else {
            let lines: Vec<String> = mtf
                .iter()
                .map(|m| {
                    format!(
                        "{}: trend={} above_sma={} momentum={:.4}",
                        m.timeframe, m.trend.as_str(), m.above_sma, m.momentum
                    )
                })
                .collect();
            format!(
                "\nHigher-timeframe context (authoritative — a lower-timeframe signal opposing \
                 these must yield WAIT, never a counter-trend call):\n{}",
                lines.join("\n")
            )
        };

        format!(
            "Symbol: {symbol}\nTimeframe: {timeframe}\nPrice: {:.prec$}\nTrend: {}\nRSI(14): {:.1}\n\
             MACD histogram: {:.4}\nADX(14): {:.1}\nResistance: {:?}\nSupport: {:?}\n\
             24h range: {:.prec$}-{:.prec$}\n{gate_note}{mtf_note}\n\
             Respond with strict JSON only: {{signal, confidence, reason, entries:[{{level,weight,\
             risk_score}}], take_profits:[{{level,reward_ratio,pct_gain}}], stop_loss, \
             stop_loss_reason, probability_of_success, expected_return}}.",
            analysis.current_price,
            analysis.trend.as_str(),
            analysis.rsi,
            analysis.macd_hist,
            analysis.adx,
            analysis.resistance,
            analysis.support,
            analysis.day_high,
            analysis.day_low,
            prec = analysis.precision,
        )
    }

    async fn call_llm(&self, prompt: &str) -> Result<String, Report<PlanError>> {
        self.limiter.until_ready().await;

        #[derive(serde::Serialize)]
        struct ChatMessage<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(serde::Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: [ChatMessage<'a>; 1],
            temperature: f64,
            max_tokens: u32,
            response_format: serde_json::Value,
        }
        #[derive(Deserialize)]
        struct ChatChoice {
            message: ChatChoiceMessage,
        }
        #[derive(Deserialize)]
        struct ChatChoiceMessage {
            content: String,
        }
        #[derive(Deserialize)]
        struct ChatResponse {
            choices: Vec<ChatChoice>,
        }

        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.3,
            max_tokens: 700,
            response_format: serde_json::json!({"type": "json_object"}),
        };

        let response = self
            .client
            .post("https://api.deepseek.com/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .change_context(PlanError::PlanGenerationFailed {
                symbol: String::new(),
                reason: "llm request failed".into(),
            })?;

        let parsed: ChatResponse = response
            .json()
            .await
            .change_context(PlanError::InvalidModelResponse {
                symbol: String::new(),
                reason: "non-json llm response".into(),
            })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                Report::new(PlanError::InvalidModelResponse {
                    symbol: String::new(),
                    reason: "empty choices".into(),
                })
            })
    }
}

impl PlanProvider for DeepSeekPlanProvider {
    fn generate_plan<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: TimeFrame,
        _exchange: ExchangeKind,
        _market: MarketType,
        candles: &'a [Candle],
        mtf: &'a [MtfSummary],
    ) -> BoxFuture<'a, Result<TradingPlan, Report<PlanError>>> {
        Box::pin(async move {
            let analysis = build_local_analysis(symbol, candles)?;
            let current_price = analysis.current_price;

            let prompt = self.build_prompt(symbol, timeframe, &analysis, mtf);
            let raw_text = match tokio::time::timeout(self.timeout, self.call_llm(&prompt)).await {
                Ok(Ok(text)) => text,
                Ok(Err(_)) | Err(_) => {
                    return Ok(hold_plan(
                        symbol,
                        timeframe,
                        current_price,
                        "llm call failed or timed out",
                    ));
                }
            };

            let raw: RawPlanResponse = match serde_json::from_str(&raw_text) {
                Ok(r) => r,
                Err(_) => {
                    return Ok(hold_plan(symbol, timeframe, current_price, "unparseable llm response"));
                }
            };

            let signal = raw
                .signal
                .as_deref()
                .and_then(PlanSignal::from_str)
                .unwrap_or(PlanSignal::Hold);

            if mtf_opposes(signal, mtf) {
                debug!(symbol, "mtf opposes signal, coercing to WAIT");
                let mut plan = hold_plan(symbol, timeframe, current_price, "higher timeframe disagrees");
                plan.signal = PlanSignal::Wait;
                plan.trend = analysis.trend;
                return Ok(plan);
            }

            let plan = TradingPlan {
                symbol: symbol.to_owned(),
                timeframe,
                generated_at: Utc::now(),
                current_price,
                trend: analysis.trend,
                signal,
                confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
                reason: raw.reason.unwrap_or_default(),
                entries: raw
                    .entries
                    .into_iter()
                    .map(|e| PlanEntry {
                        level: e.level,
                        weight: e.weight,
                        risk_score: e.risk_score,
                    })
                    .collect(),
                take_profits: raw
                    .take_profits
                    .into_iter()
                    .map(|t| TakeProfit {
                        level: t.level,
                        reward_ratio: t.reward_ratio,
                        pct_gain: t.pct_gain,
                    })
                    .collect(),
                stop_loss: raw.stop_loss.unwrap_or(current_price),
                stop_loss_reason: raw.stop_loss_reason.unwrap_or_default(),
                risk_reward_ratio: 0.0,
                probability_of_success: raw.probability_of_success.unwrap_or(0.0).clamp(0.0, 1.0),
                expected_return: raw.expected_return.unwrap_or(0.0),
                expires_at: Utc::now() + chrono::Duration::hours(timeframe.validity_hours()),
            };

            Ok(validate_or_coerce(plan, symbol))
        })
    }
}

/// Default, process-wide LLM rate limit: at most one call per second.
pub fn default_llm_limiter() -> Arc<DefaultDirectRateLimiter> {
    Arc::new(RateLimiter::direct(Quota::per_second(
        std::num::NonZeroU32::new(1).unwrap(),
    )))
}

/// Deterministic test double: returns a fixed plan, or a directional plan
/// derived from local analysis when no override is set.
pub struct MockPlanProvider {
    pub fixed: Option<TradingPlan>,
}

impl MockPlanProvider {
    pub fn new(fixed: Option<TradingPlan>) -> Self {
        Self { fixed }
    }
}

impl PlanProvider for MockPlanProvider {
    fn generate_plan<'a>(
        &'a self,
        symbol: &'a str,
        timeframe: TimeFrame,
        _exchange: ExchangeKind,
        _market: MarketType,
        candles: &'a [Candle],
        _mtf: &'a [MtfSummary],
    ) -> BoxFuture<'a, Result<TradingPlan, Report<PlanError>>> {
        Box::pin(async move {
            if let Some(plan) = &self.fixed {
                return Ok(plan.clone());
            }
            let current_price = candles.last().map(|c| c.close).unwrap_or(100.0);
            Ok(hold_plan(symbol, timeframe, current_price, "mock provider default"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExchangeKind;

    fn candles(n: usize, start: f64, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = start + step * i as f64;
                Candle {
                    exchange: ExchangeKind::Binance,
                    symbol: "BTCUSDT".into(),
                    timeframe: TimeFrame::Hour1,
                    open_time: Utc::now() + chrono::Duration::hours(i as i64),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 100.0,
                }
            })
            .collect()
    }

    #[test]
    fn hold_plan_is_never_actionable() {
        let plan = hold_plan("BTCUSDT", TimeFrame::Hour1, 100.0, "test");
        assert!(!plan.signal.is_actionable());
        assert!(plan.expires_at > plan.generated_at);
    }

    #[test]
    fn mtf_opposes_detects_bearish_conflict() {
        let mtf = vec![MtfSummary {
            timeframe: TimeFrame::Hour1,
            trend: Trend::Bearish,
            above_sma: false,
            momentum: -1.0,
        }];
        assert!(mtf_opposes(PlanSignal::Buy, &mtf));
        assert!(!mtf_opposes(PlanSignal::Sell, &mtf));
    }

    #[test]
    fn validate_or_coerce_rejects_bad_risk_reward() {
        let mut plan = hold_plan("BTCUSDT", TimeFrame::Hour1, 100.0, "base");
        plan.signal = PlanSignal::Buy;
        plan.current_price = 100.0;
        plan.entries = vec![PlanEntry {
            level: 100.0,
            weight: 1.0,
            risk_score: 3,
        }];
        plan.stop_loss = 99.0;
        plan.take_profits = vec![TakeProfit {
            level: 100.5,
            reward_ratio: 0.5,
            pct_gain: 0.5,
        }];
        let validated = validate_or_coerce(plan, "BTCUSDT");
        assert_eq!(validated.signal, PlanSignal::Hold);
    }

    #[test]
    fn validate_or_coerce_accepts_good_plan() {
        let mut plan = hold_plan("BTCUSDT", TimeFrame::Hour1, 100.0, "base");
        plan.signal = PlanSignal::Buy;
        plan.current_price = 100.0;
        plan.entries = vec![PlanEntry {
            level: 100.0,
            weight: 1.0,
            risk_score: 3,
        }];
        plan.stop_loss = 99.0;
        plan.take_profits = vec![TakeProfit {
            level: 103.0,
            reward_ratio: 3.0,
            pct_gain: 3.0,
        }];
        let validated = validate_or_coerce(plan, "BTCUSDT");
        assert_eq!(validated.signal, PlanSignal::Buy);
    }

    #[tokio::test]
    async fn mock_provider_returns_fixed_plan() {
        let fixed = hold_plan("ETHUSDT", TimeFrame::Hour4, 2000.0, "fixed");
        let provider = MockPlanProvider::new(Some(fixed.clone()));
        let plan = provider
            .generate_plan(
                "ETHUSDT",
                TimeFrame::Hour4,
                ExchangeKind::Binance,
                MarketType::Spot,
                &candles(30, 2000.0, 1.0),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(plan.symbol, fixed.symbol);
        assert_eq!(plan.reason, fixed.reason);
    }

    #[test]
    fn build_local_analysis_rejects_short_windows() {
        let result = build_local_analysis("BTCUSDT", &candles(5, 100.0, 1.0));
        assert!(result.is_err());
    }

    #[test]
    fn build_local_analysis_accepts_full_window() {
        let result = build_local_analysis("BTCUSDT", &candles(60, 100.0, 0.1));
        assert!(result.is_ok());
    }
}
