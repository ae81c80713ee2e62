use crate::indicator::Indicator;

/// Day-over-day percentage change of the close.
pub struct DailyReturn;

impl Indicator for DailyReturn {
    fn name(&self) -> &str {
        "daily_return"
    }

    fn lookback(&self) -> usize {
        1
    }

    fn series(&self, closes: &[Option<f64>]) -> Vec<Option<f64>> {
        if closes.is_empty() {
            return Vec::new();
        }
        std::iter::once(None)
            .chain(closes.windows(2).map(|w| pct_change(w[0]?, w[1]?)))
            .collect()
    }
}

// A zero previous close has no defined return.
fn pct_change(prev: f64, current: f64) -> Option<f64> {
    if prev == 0.0 {
        return None;
    }
    Some((current - prev) / prev)
}
