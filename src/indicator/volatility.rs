use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices};
use crate::model::Candle;

/// Rolling standard deviation of closing prices, expressed as a percentage
/// of the window's mean — comparable across symbols of different price
/// scale.
pub struct Volatility {
    period: usize,
}

impl Volatility {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period < 2 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be >= 2".into(),
            });
        }
        Ok(Self { period })
    }
}

impl Indicator for Volatility {
    fn name(&self) -> &str {
        "volatility"
    }

    fn required_candles(&self) -> usize {
        self.period
    }

    fn calculate(&self, candles: &[Candle]) -> Result<Vec<f64>, Report<IndicatorError>> {
        let prices = close_prices(candles);
        if prices.len() < self.period {
            bail!(IndicatorError::InsufficientData {
                required: self.period,
                available: prices.len(),
            });
        }

        Ok(prices
            .windows(self.period)
            .map(|w| {
                let mean = w.iter().sum::<f64>() / self.period as f64;
                let variance =
                    w.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / self.period as f64;
                if mean == 0.0 {
                    0.0
                } else {
                    variance.sqrt() / mean * 100.0
                }
            })
            .collect())
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
    fn volatility_period_too_small_invalid() {
        assert!(Volatility::new(1).is_err());
    }

    #[test]
    fn flat_prices_are_zero_volatility() {
        let vol = Volatility::new(5).unwrap();
        let candles = candles_from_closes(&[100.0; 10]);
        let values = vol.calculate(&candles).unwrap();
        for v in values {
            assert!(v.abs() < 1e-9);
        }
    }

    #[test]
    fn volatile_prices_score_higher_than_flat() {
        let vol = Volatility::new(5).unwrap();
        let flat = candles_from_closes(&[100.0; 10]);
        let jumpy = candles_from_closes(&[100.0, 110.0, 90.0, 115.0, 85.0, 100.0, 120.0, 80.0, 105.0, 95.0]);
        let flat_vals = vol.calculate(&flat).unwrap();
        let jumpy_vals = vol.calculate(&jumpy).unwrap();
        assert!(jumpy_vals[0] > flat_vals[0]);
    }
}
