use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::Indicator;
use crate::model::Candle;

/// Average Directional Index, Wilder's smoothing over +DI/-DI.
///
/// Falls back to a neutral reading (25.0) rather than failing when the
/// true range sums to zero across the smoothing window, mirroring the
/// degrade-rather-than-crash posture used elsewhere in scoring.
pub struct Adx {
    period: usize,
}

impl Adx {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }
}

impl Indicator for Adx {
    fn name(&self) -> &str {
        "adx"
    }

    fn required_candles(&self) -> usize {
        self.period * 2 + 1
    }

    fn calculate(&self, candles: &[Candle]) -> Result<Vec<f64>, Report<IndicatorError>> {
        if candles.len() < self.required_candles() {
            bail!(IndicatorError::InsufficientData {
                required: self.required_candles(),
                available: candles.len(),
            });
        }

        let n = candles.len();
        let mut plus_dm = Vec::with_capacity(n - 1);
        let mut minus_dm = Vec::with_capacity(n - 1);
        let mut tr = Vec::with_capacity(n - 1);

        for i in 1..n {
            let up_move = candles[i].high - candles[i - 1].high;
            let down_move = candles[i - 1].low - candles[i].low;

            plus_dm.push(if up_move > down_move && up_move > 0.0 {
                up_move
            } else {
                0.0
            });
            minus_dm.push(if down_move > up_move && down_move > 0.0 {
                down_move
            } else {
                0.0
            });

            let range = (candles[i].high - candles[i].low)
                .max((candles[i].high - candles[i - 1].close).abs())
                .max((candles[i].low - candles[i - 1].close).abs());
            tr.push(range);
        }

        let period = self.period;
        let wilder_smooth = |series: &[f64]| -> Vec<f64> {
            let mut smoothed = Vec::with_capacity(series.len() - period + 1);
            let mut acc: f64 = series[..period].iter().sum();
            smoothed.push(acc);
            for &v in &series[period..] {
                acc = acc - (acc / period as f64) + v;
                smoothed.push(acc);
            }
            smoothed
        };

        let smoothed_tr = wilder_smooth(&tr);
        let smoothed_plus = wilder_smooth(&plus_dm);
        let smoothed_minus = wilder_smooth(&minus_dm);

        let mut dx = Vec::with_capacity(smoothed_tr.len());
        for i in 0..smoothed_tr.len() {
            if smoothed_tr[i] == 0.0 {
                dx.push(25.0);
                continue;
            }
            let plus_di = 100.0 * smoothed_plus[i] / smoothed_tr[i];
            let minus_di = 100.0 * smoothed_minus[i] / smoothed_tr[i];
            let sum = plus_di + minus_di;
            if sum == 0.0 {
                dx.push(0.0);
            } else {
                dx.push(100.0 * (plus_di - minus_di).abs() / sum);
            }
        }

        if dx.len() < period {
            // Not enough DX values to smooth into ADX; return the simple
            // average as a best-effort reading rather than failing outright.
            let avg = dx.iter().sum::<f64>() / dx.len() as f64;
            return Ok(vec![avg]);
        }

        let adx = wilder_smooth(&dx)
            .into_iter()
            .map(|s| s / period as f64)
            .collect::<Vec<_>>();

        Ok(adx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExchangeKind, TimeFrame};
    use chrono::Utc;

    fn candle(i: i64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            exchange: ExchangeKind::Binance,
            symbol: "TEST".into(),
            timeframe: TimeFrame::Min1,
            open_time: Utc::now() + chrono::Duration::minutes(i),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn adx_period_zero_invalid() {
        assert!(Adx::new(0).is_err());
    }

    #[test]
    fn adx_insufficient_data() {
        let adx = Adx::new(14).unwrap();
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, 10.0, 9.0, 9.5)).collect();
        assert!(adx.calculate(&candles).is_err());
    }

    #[test]
    fn adx_strong_uptrend_scores_high() {
        let adx = Adx::new(5).unwrap();
        let mut candles = Vec::new();
        let mut price = 100.0;
        for i in 0..30 {
            candles.push(candle(i, price + 2.0, price - 0.2, price + 1.5));
            price += 2.0;
        }
        let values = adx.calculate(&candles).unwrap();
        assert!(!values.is_empty());
        assert!(values.last().unwrap() > &20.0);
    }

    #[test]
    fn adx_flat_market_scores_low() {
        let adx = Adx::new(5).unwrap();
        let candles: Vec<Candle> = (0..30).map(|i| candle(i, 10.05, 9.95, 10.0)).collect();
        let values = adx.calculate(&candles).unwrap();
        assert!(!values.is_empty());
        assert!(values.last().unwrap() < &30.0);
    }
}
