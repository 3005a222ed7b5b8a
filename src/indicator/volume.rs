use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::{Indicator, volumes};
use crate::model::Candle;

/// Volume Moving Average — simple average of trading volume over a period.
pub struct VolumeMA {
    period: usize,
}

impl VolumeMA {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }

    /// Returns `true` for each position where the current volume exceeds
    /// `surge_multiplier * volume_ma`.
    #[allow(dead_code)]
    pub fn detect_surges(&self, candles: &[Candle], surge_multiplier: f64) -> Vec<bool> {
        let vols = volumes(candles);
        if vols.len() < self.period {
            return vec![];
        }
        vols.windows(self.period)
            .enumerate()
            .map(|(i, window)| {
                let ma = window.iter().sum::<f64>() / self.period as f64;
                let current_vol = vols[i + self.period - 1];
                current_vol > ma * surge_multiplier
            })
            .collect()
    }
}

impl Indicator for VolumeMA {
    fn name(&self) -> &str {
        "volume_ma"
    }

    fn required_candles(&self) -> usize {
        self.period
    }

    /// Returns volume MA values.
    fn calculate(&self, candles: &[Candle]) -> Result<Vec<f64>, Report<IndicatorError>> {
        let vols = volumes(candles);
        if vols.len() < self.period {
            bail!(IndicatorError::InsufficientData {
                required: self.period,
                available: vols.len(),
            });
        }
        Ok(vols
            .windows(self.period)
            .map(|w| w.iter().sum::<f64>() / self.period as f64)
            .collect())
    }
}
