use chrono::{DateTime, Utc};
use error_stack::{Report, bail};
use futures::future::BoxFuture;
use tracing::warn;

use crate::error::ScreenError;
use crate::indicator::adx::Adx;
use crate::indicator::ma::Ema;
use crate::indicator::macd::Macd;
use crate::indicator::rsi::Rsi;
use crate::indicator::volume::VolumeMA;
use crate::indicator::Indicator;
use crate::mdf::MarketDataFetcher;
use crate::model::{Candle, ExchangeKind, MarketType, TimeFrame, Trend};

/// Static top-N USDT pair universe, standing in for a live exchange volume
/// query until one is wired up.
pub const TOP_USDT_PAIRS: &[&str] = &[
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT", "AVAXUSDT", "DOGEUSDT",
    "DOTUSDT", "MATICUSDT", "LINKUSDT", "SHIBUSDT", "LTCUSDT", "BCHUSDT", "UNIUSDT", "ATOMUSDT",
    "XLMUSDT", "ETCUSDT", "XMRUSDT", "AAVEUSDT", "MKRUSDT", "COMPUSDT", "SUSHIUSDT", "CRVUSDT",
    "YFIUSDT", "FILUSDT", "VETUSDT", "THETAUSDT", "ICPUSDT", "TRXUSDT", "EOSUSDT", "XEMUSDT",
    "NEOUSDT", "FTMUSDT", "KAVAUSDT", "ROSEUSDT", "AXSUSDT", "SANDUSDT", "MANAUSDT", "GALAUSDT",
    "ENJUSDT", "CHZUSDT", "SNXUSDT", "RUNEUSDT", "1INCHUSDT",
];

const LOCAL_SCORE_GATE: f64 = 60.0;
const STAGE_B_BATCH_SIZE: usize = 10;
const STAGE_B_BATCH_DELAY: std::time::Duration = std::time::Duration::from_secs(1);
const NEUTRAL_STAGE_B_SCORE: f64 = 5.0;

/// Stage A's local score plus the trend/signal breadcrumbs that justified it.
#[derive(Debug, Clone)]
pub struct LocalScore {
    pub symbol: String,
    pub score: f64,
    pub trend: Trend,
    pub signals: Vec<String>,
    pub current_price: f64,
}

/// Final per-symbol screening outcome: Stage A score blended with an
/// optional Stage B refinement.
#[derive(Debug, Clone)]
pub struct ScreenResult {
    pub symbol: String,
    pub score: f64,
    pub trend: Trend,
    pub signals: Vec<String>,
    pub current_price: f64,
    pub analysis: String,
}

#[derive(Debug, Clone)]
pub struct ScreeningSummary {
    pub total: usize,
    pub avg_score: f64,
    pub top_score: f64,
    pub bullish: usize,
    pub bearish: usize,
    pub neutral: usize,
    pub timeframe: TimeFrame,
    pub ts: DateTime<Utc>,
}

/// Optional second-stage refinement, called only for Stage A survivors.
/// Implementations should degrade to a neutral score on failure rather than
/// fail the whole screening pass.
pub trait QuickScoreProvider: Send + Sync {
    fn quick_score<'a>(
        &'a self,
        symbol: &'a str,
        local: &'a LocalScore,
    ) -> BoxFuture<'a, QuickScoreResult>;
}

#[derive(Debug, Clone)]
pub struct QuickScoreResult {
    pub score: f64,
    pub trend: Trend,
    pub signals: Vec<String>,
    pub analysis: String,
}

/// Stage A local score: trend alignment (30), RSI zone (20), MACD (15),
/// ADX (10), volume vs 20-SMA (15), short-window price action (10).
pub fn local_score(symbol: &str, candles: &[Candle]) -> Result<LocalScore, Report<ScreenError>> {
    if candles.len() < 50 {
        bail!(ScreenError::ScoringFailed {
            symbol: symbol.to_owned(),
        });
    }

    let mut score = 0.0f64;
    let mut signals = Vec::new();
    let current_price = candles.last().unwrap().close;

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let ema20 = Ema::new(20)
        .ok()
        .and_then(|e| e.calculate_prices(&closes).ok())
        .and_then(|v| v.last().copied())
        .unwrap_or(current_price);
    let ema50 = Ema::new(50)
        .ok()
        .and_then(|e| e.calculate_prices(&closes).ok())
        .and_then(|v| v.last().copied())
        .unwrap_or(current_price);

    let trend;
    if current_price > ema20 && ema20 > ema50 {
        score += 30.0;
        signals.push("strong uptrend: price > EMA20 > EMA50".to_string());
        trend = Trend::Bullish;
    } else if current_price > ema20 {
        score += 20.0;
        signals.push("moderate uptrend: price > EMA20".to_string());
        trend = Trend::Bullish;
    } else if current_price < ema20 && ema20 < ema50 {
        score -= 10.0;
        signals.push("downtrend: price < EMA20 < EMA50".to_string());
        trend = Trend::Bearish;
    } else {
        score += 10.0;
        trend = Trend::Sideways;
    }

    let rsi = Rsi::new(14)
        .ok()
        .and_then(|r| r.calculate(candles).ok())
        .and_then(|v| v.last().copied())
        .unwrap_or(50.0);
    if (40.0..=60.0).contains(&rsi) {
        score += 20.0;
        signals.push(format!("RSI in healthy zone ({rsi:.1})"));
    } else if (30.0..40.0).contains(&rsi) {
        score += 15.0;
        signals.push(format!("RSI approaching oversold ({rsi:.1})"));
    } else if (60.0..=70.0).contains(&rsi) {
        score += 15.0;
        signals.push(format!("RSI approaching overbought ({rsi:.1})"));
    } else if rsi < 30.0 {
        score += 5.0;
        signals.push(format!("RSI oversold ({rsi:.1})"));
    } else {
        signals.push(format!("RSI overbought ({rsi:.1})"));
    }

    let macd_hist = Macd::new(12, 26, 9)
        .ok()
        .and_then(|m| m.calculate(candles).ok())
        .and_then(|v| v.last().copied())
        .unwrap_or(0.0);
    if macd_hist > 0.0 {
        score += 15.0;
        signals.push("MACD bullish momentum".to_string());
    }

    let adx = Adx::new(14)
        .ok()
        .and_then(|a| a.calculate(candles).ok())
        .and_then(|v| v.last().copied())
        .unwrap_or(25.0);
    if adx > 25.0 {
        score += 10.0;
        signals.push(format!("strong trend (ADX {adx:.1})"));
    } else if adx > 20.0 {
        score += 5.0;
        signals.push(format!("moderate trend (ADX {adx:.1})"));
    }

    let avg_volume = VolumeMA::new(20)
        .ok()
        .and_then(|ma| ma.calculate(candles).ok())
        .and_then(|v| v.last().copied())
        .unwrap_or(candles.last().unwrap().volume);
    let current_volume = candles.last().unwrap().volume;
    if avg_volume > 0.0 && current_volume > avg_volume * 1.5 {
        score += 15.0;
        signals.push("high volume (1.5x average)".to_string());
    } else if current_volume > avg_volume {
        score += 10.0;
        signals.push("above average volume".to_string());
    }

    let n = candles.len();
    if n > 5 && current_price > candles[n - 5].close {
        score += 10.0;
        signals.push("price moving up over 5 periods".to_string());
    } else if n > 10 && current_price > candles[n - 10].close {
        score += 5.0;
        signals.push("price stable up over 10 periods".to_string());
    }

    Ok(LocalScore {
        symbol: symbol.to_owned(),
        score: score.clamp(0.0, 100.0),
        trend,
        signals,
        current_price,
    })
}

/// Stage A over the whole universe: fetch a 100-bar window per symbol,
/// score locally, drop anything below `gate`.
pub async fn screen_universe(
    mdf: &MarketDataFetcher,
    exchange: ExchangeKind,
    market: MarketType,
    universe: &[&str],
    timeframe: TimeFrame,
    gate: f64,
) -> Vec<LocalScore> {
    let mut survivors = Vec::new();
    for &symbol in universe {
        let candles = match mdf.fetch_candles(exchange, market, symbol, timeframe, 100).await {
            Ok(c) if c.len() >= 50 => c,
            Ok(_) => continue,
            Err(e) => {
                warn!(symbol, error = ?e, "failed to fetch candles for screening");
                continue;
            }
        };
        match local_score(symbol, &candles) {
            Ok(scored) if scored.score >= gate => survivors.push(scored),
            Ok(_) => {}
            Err(e) => warn!(symbol, error = ?e, "local scoring failed"),
        }
    }
    survivors
}

/// Stage B: batched LLM quick-score over Stage A survivors, at most
/// `STAGE_B_BATCH_SIZE` in flight with a delay between batches. On failure
/// each symbol degrades to a neutral score instead of stalling the pass.
pub async fn refine_with_quick_score(
    provider: &dyn QuickScoreProvider,
    survivors: Vec<LocalScore>,
) -> Vec<ScreenResult> {
    let mut results = Vec::with_capacity(survivors.len());
    for (batch_index, batch) in survivors.chunks(STAGE_B_BATCH_SIZE).enumerate() {
        let scored = futures::future::join_all(batch.iter().map(|local| async move {
            let outcome = provider.quick_score(&local.symbol, local).await;
            ScreenResult {
                symbol: local.symbol.clone(),
                score: outcome.score,
                trend: outcome.trend,
                signals: outcome.signals,
                current_price: local.current_price,
                analysis: outcome.analysis,
            }
        }))
        .await;
        results.extend(scored);
        if (batch_index + 1) * STAGE_B_BATCH_SIZE < survivors.len() {
            tokio::time::sleep(STAGE_B_BATCH_DELAY).await;
        }
    }
    results
}

/// Full two-stage screening pass returning the ranked, truncated result set
/// plus its summary.
pub async fn screen_market(
    mdf: &MarketDataFetcher,
    exchange: ExchangeKind,
    market: MarketType,
    quick_score: Option<&dyn QuickScoreProvider>,
    universe: &[&str],
    timeframe: TimeFrame,
    max_results: usize,
) -> (Vec<ScreenResult>, ScreeningSummary) {
    let survivors = screen_universe(mdf, exchange, market, universe, timeframe, LOCAL_SCORE_GATE).await;

    let mut results = match quick_score {
        Some(provider) => refine_with_quick_score(provider, survivors).await,
        None => survivors
            .into_iter()
            .map(|local| ScreenResult {
                symbol: local.symbol.clone(),
                score: local.score,
                trend: local.trend,
                signals: local.signals,
                current_price: local.current_price,
                analysis: String::new(),
            })
            .collect(),
    };

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    results.truncate(max_results);

    let summary = summarize(&results, timeframe);
    (results, summary)
}

fn summarize(results: &[ScreenResult], timeframe: TimeFrame) -> ScreeningSummary {
    let total = results.len();
    if total == 0 {
        return ScreeningSummary {
            total: 0,
            avg_score: 0.0,
            top_score: 0.0,
            bullish: 0,
            bearish: 0,
            neutral: 0,
            timeframe,
            ts: Utc::now(),
        };
    }
    let avg_score = results.iter().map(|r| r.score).sum::<f64>() / total as f64;
    let top_score = results[0].score;
    let bullish = results.iter().filter(|r| r.trend == Trend::Bullish).count();
    let bearish = results.iter().filter(|r| r.trend == Trend::Bearish).count();
    let neutral = total - bullish - bearish;
    ScreeningSummary {
        total,
        avg_score,
        top_score,
        bullish,
        bearish,
        neutral,
        timeframe,
        ts: Utc::now(),
    }
}

/// Degrades any Stage B failure to a neutral score so the pipeline never
/// stalls on a single LLM failure.
pub struct NeutralFallbackQuickScore;

impl QuickScoreProvider for NeutralFallbackQuickScore {
    fn quick_score<'a>(
        &'a self,
        _symbol: &'a str,
        local: &'a LocalScore,
    ) -> BoxFuture<'a, QuickScoreResult> {
        Box::pin(async move {
            QuickScoreResult {
                score: NEUTRAL_STAGE_B_SCORE,
                trend: local.trend,
                signals: local.signals.clone(),
                analysis: "neutral fallback: quick-score provider unavailable".into(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trending_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64 * 0.8;
                Candle {
                    exchange: ExchangeKind::Binance,
                    symbol: "BTCUSDT".into(),
                    timeframe: TimeFrame::Hour4,
                    open_time: Utc::now() + chrono::Duration::hours(i as i64 * 4),
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 100.0 + i as f64,
                }
            })
            .collect()
    }

    #[test]
    fn local_score_rejects_short_windows() {
        let result = local_score("BTCUSDT", &trending_candles(10));
        assert!(result.is_err());
    }

    #[test]
    fn local_score_favors_clean_uptrend() {
        let scored = local_score("BTCUSDT", &trending_candles(100)).unwrap();
        assert!(scored.score > 0.0);
        assert_eq!(scored.trend, Trend::Bullish);
    }

    #[tokio::test]
    async fn neutral_fallback_reports_fixed_score() {
        let local = local_score("BTCUSDT", &trending_candles(100)).unwrap();
        let outcome = NeutralFallbackQuickScore.quick_score("BTCUSDT", &local).await;
        assert_eq!(outcome.score, NEUTRAL_STAGE_B_SCORE);
    }

    #[test]
    fn summarize_empty_results() {
        let summary = summarize(&[], TimeFrame::Hour4);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.avg_score, 0.0);
    }

    #[test]
    fn summarize_counts_trend_buckets() {
        let results = vec![
            ScreenResult {
                symbol: "A".into(),
                score: 80.0,
                trend: Trend::Bullish,
                signals: vec![],
                current_price: 1.0,
                analysis: String::new(),
            },
            ScreenResult {
                symbol: "B".into(),
                score: 40.0,
                trend: Trend::Bearish,
                signals: vec![],
                current_price: 1.0,
                analysis: String::new(),
            },
        ];
        let summary = summarize(&results, TimeFrame::Hour4);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.top_score, 80.0);
        assert_eq!(summary.bullish, 1);
        assert_eq!(summary.bearish, 1);
    }

    #[test]
    fn ranking_breaks_score_ties_by_symbol_ascending() {
        let mut results = vec![
            ScreenResult {
                symbol: "ETHUSDT".into(),
                score: 50.0,
                trend: Trend::Bullish,
                signals: vec![],
                current_price: 1.0,
                analysis: String::new(),
            },
            ScreenResult {
                symbol: "BTCUSDT".into(),
                score: 50.0,
                trend: Trend::Bullish,
                signals: vec![],
                current_price: 1.0,
                analysis: String::new(),
            },
            ScreenResult {
                symbol: "ADAUSDT".into(),
                score: 90.0,
                trend: Trend::Bullish,
                signals: vec![],
                current_price: 1.0,
                analysis: String::new(),
            },
        ];
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        let symbols: Vec<&str> = results.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["ADAUSDT", "BTCUSDT", "ETHUSDT"]);
    }
}
