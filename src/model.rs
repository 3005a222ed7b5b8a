use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    Binance,
    Bybit,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binance => write!(f, "binance"),
            Self::Bybit => write!(f, "bybit"),
        }
    }
}

impl ExchangeKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "binance" => Some(Self::Binance),
            "bybit" => Some(Self::Bybit),
            _ => None,
        }
    }

    /// The other exchange, used for the one-shot fallback attempt.
    pub fn alternate(self) -> Self {
        match self {
            Self::Binance => Self::Bybit,
            Self::Bybit => Self::Binance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketType {
    Spot,
    Futures,
    /// Try futures first, fall back to spot on a per-exchange basis. Not a
    /// wire-level market type itself — resolved to `Futures`/`Spot` before
    /// an exchange request is made.
    Auto,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Futures => write!(f, "futures"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl MarketType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "spot" => Some(Self::Spot),
            "futures" => Some(Self::Futures),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }

    /// The concrete market types to try, in order, for a request in this
    /// mode. `Auto` tries futures first, then spot.
    pub fn resolution_order(self) -> &'static [MarketType] {
        match self {
            Self::Spot => &[MarketType::Spot],
            Self::Futures => &[MarketType::Futures],
            Self::Auto => &[MarketType::Futures, MarketType::Spot],
        }
    }
}

/// Candle timeframe supported by the application.
///
/// String representations match the config/preference format (e.g. `"1m"`, `"1h"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour2,
    Hour4,
    Day1,
    Week1,
}

impl TimeFrame {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::Min1),
            "5m" => Some(Self::Min5),
            "15m" => Some(Self::Min15),
            "30m" => Some(Self::Min30),
            "1h" => Some(Self::Hour1),
            "2h" => Some(Self::Hour2),
            "4h" => Some(Self::Hour4),
            "1d" => Some(Self::Day1),
            "1w" => Some(Self::Week1),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour2 => "2h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
            Self::Week1 => "1w",
        }
    }

    /// Canonical duration in minutes, used for ordering and freshness windows.
    pub fn duration_minutes(self) -> i64 {
        match self {
            Self::Min1 => 1,
            Self::Min5 => 5,
            Self::Min15 => 15,
            Self::Min30 => 30,
            Self::Hour1 => 60,
            Self::Hour2 => 120,
            Self::Hour4 => 240,
            Self::Day1 => 1_440,
            Self::Week1 => 10_080,
        }
    }

    /// Cache/freshness window: one full timeframe duration.
    pub fn freshness_window(self) -> Duration {
        Duration::minutes(self.duration_minutes())
    }

    pub fn binance_interval(self) -> &'static str {
        self.as_str()
    }

    /// Bybit v5 kline interval string (minutes, or D/W).
    pub fn bybit_interval(self) -> &'static str {
        match self {
            Self::Min1 => "1",
            Self::Min5 => "5",
            Self::Min15 => "15",
            Self::Min30 => "30",
            Self::Hour1 => "60",
            Self::Hour2 => "120",
            Self::Hour4 => "240",
            Self::Day1 => "D",
            Self::Week1 => "W",
        }
    }

    /// Plan validity window per the design decision on expires_at.
    pub fn validity_hours(self) -> i64 {
        match self {
            Self::Min1 | Self::Min15 => 1,
            Self::Min30 => 2,
            Self::Hour1 => 3,
            Self::Hour2 => 4,
            Self::Hour4 => 6,
            Self::Day1 => 12,
            Self::Week1 => 24,
        }
    }

    /// Lower timeframes consulted for multi-timeframe confluence.
    pub fn mtf_children(self) -> &'static [TimeFrame] {
        match self {
            Self::Day1 => &[Self::Hour4, Self::Hour1],
            Self::Hour4 => &[Self::Hour1],
            Self::Hour2 => &[Self::Hour1],
            _ => &[],
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Candle {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// `low <= min(open,close) <= max(open,close) <= high`, `volume >= 0`.
    pub fn is_valid(&self) -> bool {
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low <= lo && lo <= hi && hi <= self.high && self.volume >= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Premium,
    Admin,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "premium" => Some(Self::Premium),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub chat_id: i64,
    pub tier: Tier,
    pub enabled: bool,
    pub tier_expires_at: Option<DateTime<Utc>>,
    pub default_exchange: ExchangeKind,
    pub market_type: MarketType,
}

/// One row of the tier/billing audit log (`subscription_history`):
/// write-only, never read back by the core.
#[derive(Debug, Clone)]
pub struct TierChange {
    pub chat_id: i64,
    pub tier: Tier,
    pub action: String,
    pub duration_days: Option<i64>,
    pub payment_amount: Option<f64>,
    pub payment_method: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub chat_id: i64,
    pub symbol: String,
    pub timeframe: TimeFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDirection {
    Above,
    Below,
}

impl AlertDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            _ => None,
        }
    }

    /// Whether `price` has crossed the target for this direction.
    pub fn crossed(self, price: f64, target: f64) -> bool {
        match self {
            Self::Above => price >= target,
            Self::Below => price <= target,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriceAlert {
    pub id: i64,
    pub chat_id: i64,
    pub symbol: String,
    pub direction: AlertDirection,
    pub target_price: f64,
    pub triggered: bool,
}

#[derive(Debug, Clone)]
pub struct ScreeningSchedule {
    pub chat_id: i64,
    pub timeframe: TimeFrame,
    pub interval_minutes: i64,
    pub min_score: f64,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
}

pub const VALID_SCREENING_INTERVALS: &[i64] = &[15, 30, 60, 120, 180, 240, 360, 720, 1440];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Sideways,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Sideways => "SIDEWAYS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSignal {
    Buy,
    Sell,
    Hold,
    Wait,
    ScalpLong,
    ScalpShort,
}

impl PlanSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Wait => "WAIT",
            Self::ScalpLong => "SCALP_LONG",
            Self::ScalpShort => "SCALP_SHORT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "HOLD" => Some(Self::Hold),
            "WAIT" => Some(Self::Wait),
            "SCALP_LONG" => Some(Self::ScalpLong),
            "SCALP_SHORT" => Some(Self::ScalpShort),
            _ => None,
        }
    }

    /// Actionable signal: strictly BUY/SELL or one of the scalp variants,
    /// never HOLD/WAIT.
    pub fn is_actionable(self) -> bool {
        !matches!(self, Self::Hold | Self::Wait)
    }

    pub fn is_bullish_side(self) -> bool {
        matches!(self, Self::Buy | Self::ScalpLong)
    }

    pub fn is_bearish_side(self) -> bool {
        matches!(self, Self::Sell | Self::ScalpShort)
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PlanEntry {
    pub level: f64,
    pub weight: f64,
    pub risk_score: u8,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct TakeProfit {
    pub level: f64,
    pub reward_ratio: f64,
    pub pct_gain: f64,
}

#[derive(Debug, Clone)]
pub struct TradingPlan {
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub generated_at: DateTime<Utc>,
    pub current_price: f64,
    pub trend: Trend,
    pub signal: PlanSignal,
    pub confidence: f64,
    pub reason: String,
    pub entries: Vec<PlanEntry>,
    pub take_profits: Vec<TakeProfit>,
    pub stop_loss: f64,
    pub stop_loss_reason: String,
    pub risk_reward_ratio: f64,
    pub probability_of_success: f64,
    pub expected_return: f64,
    pub expires_at: DateTime<Utc>,
}

impl TradingPlan {
    pub fn min_entry(&self) -> Option<f64> {
        self.entries
            .iter()
            .map(|e| e.level)
            .fold(None, |acc, l| Some(acc.map_or(l, |a: f64| a.min(l))))
    }

    pub fn max_entry(&self) -> Option<f64> {
        self.entries
            .iter()
            .map(|e| e.level)
            .fold(None, |acc, l| Some(acc.map_or(l, |a: f64| a.max(l))))
    }

    pub fn min_take_profit(&self) -> Option<f64> {
        self.take_profits
            .iter()
            .map(|t| t.level)
            .fold(None, |acc, l| Some(acc.map_or(l, |a: f64| a.min(l))))
    }

    pub fn max_take_profit(&self) -> Option<f64> {
        self.take_profits
            .iter()
            .map(|t| t.level)
            .fold(None, |acc, l| Some(acc.map_or(l, |a: f64| a.max(l))))
    }

    /// Validates the direction invariants: for the bullish side, all entries
    /// sit within 1.5% above spot, the stop sits below every entry, and the
    /// nearest take-profit clears the furthest entry. Mirrored for the
    /// bearish side.
    pub fn satisfies_direction_invariants(&self) -> bool {
        if self.entries.is_empty() || self.take_profits.is_empty() {
            return false;
        }
        let (min_e, max_e) = match (self.min_entry(), self.max_entry()) {
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };

        if self.signal.is_bullish_side() {
            let band = self.current_price * 1.015;
            let min_tp = match self.min_take_profit() {
                Some(v) => v,
                None => return false,
            };
            self.entries.iter().all(|e| e.level <= band)
                && self.stop_loss < min_e
                && min_tp > max_e
        } else if self.signal.is_bearish_side() {
            let band = self.current_price * 0.985;
            let max_tp = match self.max_take_profit() {
                Some(v) => v,
                None => return false,
            };
            self.entries.iter().all(|e| e.level >= band)
                && self.stop_loss > max_e
                && max_tp < min_e
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Pending,
    Won,
    Lost,
    Breakeven,
}

impl SignalOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Breakeven => "breakeven",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "won" => Some(Self::Won),
            "lost" => Some(Self::Lost),
            "breakeven" => Some(Self::Breakeven),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalHistoryRow {
    pub id: i64,
    pub chat_id: i64,
    pub symbol: String,
    pub timeframe: TimeFrame,
    pub signal: PlanSignal,
    pub confidence: f64,
    pub entries_json: String,
    pub take_profits_json: String,
    pub stop_loss: f64,
    pub generated_at: DateTime<Utc>,
    pub outcome: SignalOutcome,
    pub actual_return_pct: Option<f64>,
    pub outcome_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_round_trip() {
        let frames = [
            ("1m", TimeFrame::Min1),
            ("5m", TimeFrame::Min5),
            ("15m", TimeFrame::Min15),
            ("30m", TimeFrame::Min30),
            ("1h", TimeFrame::Hour1),
            ("2h", TimeFrame::Hour2),
            ("4h", TimeFrame::Hour4),
            ("1d", TimeFrame::Day1),
            ("1w", TimeFrame::Week1),
        ];
        for (s, tf) in frames {
            assert_eq!(TimeFrame::from_str(s), Some(tf));
            assert_eq!(tf.as_str(), s);
        }
    }

    #[test]
    fn timeframe_invalid_string_returns_none() {
        assert_eq!(TimeFrame::from_str("3m"), None);
        assert_eq!(TimeFrame::from_str(""), None);
    }

    #[test]
    fn exchange_kind_display_and_serde() {
        assert_eq!(ExchangeKind::Binance.to_string(), "binance");
        assert_eq!(ExchangeKind::Bybit.to_string(), "bybit");
        let json = serde_json::to_string(&ExchangeKind::Bybit).unwrap();
        let parsed: ExchangeKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ExchangeKind::Bybit);
    }

    #[test]
    fn auto_market_resolves_futures_then_spot() {
        assert_eq!(
            MarketType::Auto.resolution_order(),
            &[MarketType::Futures, MarketType::Spot]
        );
        assert_eq!(MarketType::Spot.resolution_order(), &[MarketType::Spot]);
        assert_eq!(MarketType::from_str("auto"), Some(MarketType::Auto));
    }

    #[test]
    fn exchange_alternate_is_involution() {
        assert_eq!(ExchangeKind::Binance.alternate(), ExchangeKind::Bybit);
        assert_eq!(ExchangeKind::Bybit.alternate(), ExchangeKind::Binance);
    }

    #[test]
    fn mtf_hierarchy_matches_design() {
        assert_eq!(TimeFrame::Day1.mtf_children(), &[TimeFrame::Hour4, TimeFrame::Hour1]);
        assert_eq!(TimeFrame::Hour4.mtf_children(), &[TimeFrame::Hour1]);
        assert_eq!(TimeFrame::Hour2.mtf_children(), &[TimeFrame::Hour1]);
        assert!(TimeFrame::Hour1.mtf_children().is_empty());
    }

    #[test]
    fn candle_validity() {
        let mut c = Candle {
            exchange: ExchangeKind::Binance,
            symbol: "BTCUSDT".into(),
            timeframe: TimeFrame::Min1,
            open_time: Utc::now(),
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 1.0,
        };
        assert!(c.is_valid());
        c.low = 11.5;
        assert!(!c.is_valid());
        c.low = 9.0;
        c.volume = -1.0;
        assert!(!c.is_valid());
    }

    #[test]
    fn alert_direction_crossing() {
        assert!(AlertDirection::Above.crossed(100.0, 100.0));
        assert!(AlertDirection::Above.crossed(101.0, 100.0));
        assert!(!AlertDirection::Above.crossed(99.0, 100.0));
        assert!(AlertDirection::Below.crossed(100.0, 100.0));
        assert!(!AlertDirection::Below.crossed(101.0, 100.0));
    }

    #[test]
    fn plan_signal_actionability() {
        assert!(PlanSignal::Buy.is_actionable());
        assert!(PlanSignal::Sell.is_actionable());
        assert!(!PlanSignal::Hold.is_actionable());
        assert!(!PlanSignal::Wait.is_actionable());
        assert!(PlanSignal::ScalpLong.is_actionable());
    }

    fn sample_buy_plan(price: f64, entries: &[f64], sl: f64, tps: &[f64]) -> TradingPlan {
        TradingPlan {
            symbol: "BTCUSDT".into(),
            timeframe: TimeFrame::Hour4,
            generated_at: Utc::now(),
            current_price: price,
            trend: Trend::Bullish,
            signal: PlanSignal::Buy,
            confidence: 0.7,
            reason: "test".into(),
            entries: entries
                .iter()
                .map(|&level| PlanEntry {
                    level,
                    weight: 1.0 / entries.len() as f64,
                    risk_score: 5,
                })
                .collect(),
            take_profits: tps
                .iter()
                .map(|&level| TakeProfit {
                    level,
                    reward_ratio: 2.0,
                    pct_gain: 1.0,
                })
                .collect(),
            stop_loss: sl,
            stop_loss_reason: "below entries".into(),
            risk_reward_ratio: 2.0,
            probability_of_success: 0.6,
            expected_return: 1.0,
            expires_at: Utc::now() + Duration::hours(6),
        }
    }

    #[test]
    fn buy_plan_invariants_hold() {
        let plan = sample_buy_plan(100.0, &[99.0, 98.5], 97.0, &[103.0, 105.0]);
        assert!(plan.satisfies_direction_invariants());
    }

    #[test]
    fn buy_plan_entry_too_far_from_price_fails() {
        let plan = sample_buy_plan(100.0, &[102.0], 97.0, &[105.0]);
        assert!(!plan.satisfies_direction_invariants());
    }

    #[test]
    fn buy_plan_stop_loss_above_entries_fails() {
        let plan = sample_buy_plan(100.0, &[99.0], 99.5, &[103.0]);
        assert!(!plan.satisfies_direction_invariants());
    }
}
