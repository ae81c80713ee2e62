use error_stack::{Report, bail};

use crate::error::IndicatorError;
use crate::indicator::Indicator;
use crate::indicator::ma::window_mean;

/// RSI (Relative Strength Index) using simple rolling means of gains and
/// losses over `period` deltas.
pub struct Rsi {
    period: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &str {
        "rsi"
    }

    // The first row has no delta, so a full window of deltas ends at index `period`.
    fn lookback(&self) -> usize {
        self.period
    }

    fn series(&self, closes: &[Option<f64>]) -> Vec<Option<f64>> {
        let mut out = vec![None; closes.len()];
        if closes.len() <= self.period {
            return out;
        }

        let deltas: Vec<Option<f64>> = std::iter::once(None)
            .chain(closes.windows(2).map(|w| Some(w[1]? - w[0]?)))
            .collect();
        let gains: Vec<Option<f64>> = deltas.iter().map(|d| d.map(|d| d.max(0.0))).collect();
        let losses: Vec<Option<f64>> = deltas.iter().map(|d| d.map(|d| (-d).max(0.0))).collect();

        for i in self.period..closes.len() {
            let window = i + 1 - self.period..=i;
            out[i] = window_mean(&gains[window.clone()])
                .zip(window_mean(&losses[window]))
                .map(|(avg_gain, avg_loss)| rsi_value(avg_gain, avg_loss));
        }
        out
    }
}

/// A window without losses reports 100, whether or not it had gains.
fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
