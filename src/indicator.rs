pub mod ma;
pub mod returns;
pub mod rsi;

use error_stack::Report;
use tracing::debug;

use crate::error::IndicatorError;
use crate::indicator::ma::Sma;
use crate::indicator::returns::DailyReturn;
use crate::indicator::rsi::Rsi;
use crate::model::{IndicatorRow, PriceRow};

pub const MA_WINDOWS: [usize; 3] = [5, 20, 50];
pub const RSI_PERIOD: usize = 14;

/// A technical indicator over a daily close series.
///
/// Input must be in ascending date order with one entry per date. Output is
/// aligned with the input: one value per row, `None` where the indicator has
/// no value (leading warm-up rows, or a missing close inside the window).
pub trait Indicator: Send + Sync {
    /// Column name of this indicator (e.g. "ma_20", "rsi").
    fn name(&self) -> &str;

    /// Number of leading rows that can never carry a value.
    fn lookback(&self) -> usize;

    fn series(&self, closes: &[Option<f64>]) -> Vec<Option<f64>>;
}

/// Extract close prices from a slice of price rows.
pub fn close_prices(rows: &[PriceRow]) -> Vec<Option<f64>> {
    rows.iter().map(|r| r.close).collect()
}

/// The fixed column set persisted for every row: MA 5/20/50, RSI-14 and
/// the daily return.
pub struct IndicatorSet {
    ma_5: Sma,
    ma_20: Sma,
    ma_50: Sma,
    rsi: Rsi,
    daily_return: DailyReturn,
}

impl IndicatorSet {
    pub fn standard() -> Result<Self, Report<IndicatorError>> {
        let [fast, mid, slow] = MA_WINDOWS;
        Ok(Self {
            ma_5: Sma::new(fast)?,
            ma_20: Sma::new(mid)?,
            ma_50: Sma::new(slow)?,
            rsi: Rsi::new(RSI_PERIOD)?,
            daily_return: DailyReturn,
        })
    }

    /// Rows of prior history needed for every column of the first new row
    /// to be fully warmed up.
    pub fn max_lookback(&self) -> usize {
        self.indicators()
            .iter()
            .map(|i| i.lookback())
            .max()
            .unwrap_or(0)
    }

    fn indicators(&self) -> [&dyn Indicator; 5] {
        [
            &self.ma_5,
            &self.ma_20,
            &self.ma_50,
            &self.rsi,
            &self.daily_return,
        ]
    }

    /// Augment an ascending, date-unique series for one ticker with every
    /// indicator column.
    pub fn compute(&self, rows: &[PriceRow]) -> Vec<IndicatorRow> {
        if rows.is_empty() {
            return Vec::new();
        }

        let closes = close_prices(rows);
        let [ma_5, ma_20, ma_50, rsi, daily_return] = self.indicators().map(|indicator| {
            let values = indicator.series(&closes);
            debug!(
                indicator = indicator.name(),
                rows = values.len(),
                defined = values.iter().filter(|v| v.is_some()).count(),
                "indicator computed"
            );
            values
        });

        rows.iter()
            .enumerate()
            .map(|(i, row)| IndicatorRow {
                ticker: row.ticker.clone(),
                date: row.date,
                close: row.close,
                ma_5: ma_5[i],
                ma_20: ma_20[i],
                ma_50: ma_50[i],
                rsi: rsi[i],
                daily_return: daily_return[i],
            })
            .collect()
    }
}

/// Compute the standard indicator columns for one ticker's series.
pub fn compute_indicators(rows: &[PriceRow]) -> Result<Vec<IndicatorRow>, Report<IndicatorError>> {
    Ok(IndicatorSet::standard()?.compute(rows))
}

#[cfg(test)]
pub(crate) fn rows_from_closes(ticker: &str, closes: &[Option<f64>]) -> Vec<PriceRow> {
    let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| PriceRow {
            ticker: ticker.to_string(),
            date: start + chrono::Duration::days(i as i64),
            close,
        })
        .collect()
}
