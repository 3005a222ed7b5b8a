use crate::indicator::ma::Ema;
use crate::indicator::{Indicator, close_prices};
use crate::model::{Candle, Trend};

/// Summarize overall trend from the relationship between a fast and slow
/// EMA, the way the scoring pass reads "trend" as a single qualitative
/// signal rather than a raw indicator series.
pub fn trend_summary(candles: &[Candle], fast_period: usize, slow_period: usize) -> Trend {
    let prices = close_prices(candles);
    if prices.len() < slow_period {
        return Trend::Sideways;
    }

    let fast = match Ema::new(fast_period).and_then(|e| e.calculate_prices(&prices)) {
        Ok(v) => v,
        Err(_) => return Trend::Sideways,
    };
    let slow = match Ema::new(slow_period).and_then(|e| e.calculate_prices(&prices)) {
        Ok(v) => v,
        Err(_) => return Trend::Sideways,
    };

    let fast_last = *fast.last().unwrap();
    let slow_last = *slow.last().unwrap();
    let spread_pct = (fast_last - slow_last) / slow_last * 100.0;

    if spread_pct > 0.25 {
        Trend::Bullish
    } else if spread_pct < -0.25 {
        Trend::Bearish
    } else {
        Trend::Sideways
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExchangeKind, TimeFrame};
    use chrono::Utc;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                exchange: ExchangeKind::Binance,
                symbol: "TEST".into(),
                timeframe: TimeFrame::Min1,
                open_time: Utc::now() + chrono::Duration::minutes(i as i64),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn rising_prices_are_bullish() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64 * 2.0).collect();
        let candles = candles_from_closes(&closes);
        assert_eq!(trend_summary(&candles, 5, 15), Trend::Bullish);
    }

    #[test]
    fn falling_prices_are_bearish() {
        let closes: Vec<f64> = (0..30).map(|i| 200.0 - i as f64 * 2.0).collect();
        let candles = candles_from_closes(&closes);
        assert_eq!(trend_summary(&candles, 5, 15), Trend::Bearish);
    }

    #[test]
    fn flat_prices_are_sideways() {
        let candles = candles_from_closes(&[100.0; 30]);
        assert_eq!(trend_summary(&candles, 5, 15), Trend::Sideways);
    }

    #[test]
    fn insufficient_data_defaults_to_sideways() {
        let candles = candles_from_closes(&[100.0; 5]);
        assert_eq!(trend_summary(&candles, 5, 15), Trend::Sideways);
    }
}
