use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::Indicator;

/// Simple Moving Average over the trailing `period` closes.
pub struct Sma {
    period: usize,
    name: String,
}

impl Sma {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self {
            period,
            name: format!("ma_{period}"),
        })
    }
}

impl Indicator for Sma {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        self.period - 1
    }

    fn series(&self, closes: &[Option<f64>]) -> Vec<Option<f64>> {
        let mut out = vec![None; closes.len()];
        for (i, window) in closes.windows(self.period).enumerate() {
            out[i + self.lookback()] = window_mean(window);
        }
        out
    }
}

/// Mean of a window, or `None` if any value in it is missing.
pub(crate) fn window_mean(window: &[Option<f64>]) -> Option<f64> {
    let sum = window.iter().copied().sum::<Option<f64>>()?;
    Some(sum / window.len() as f64)
}
