use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use error_stack::Report;
use tracing::debug;

use crate::error::StorageError;
use crate::model::{IndicatorRow, NormalizedPoint, PriceRow};
use crate::storage::Storage;

/// Read API behind the dashboard and the CLI read commands.
pub struct Repository {
    storage: Arc<dyn Storage>,
}

impl Repository {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn get_available_tickers(&self) -> Result<Vec<String>, Report<StorageError>> {
        self.storage.available_tickers().await
    }

    pub async fn get_prices_series(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceRow>, Report<StorageError>> {
        let rows = self.get_indicator_series(tickers, start, end).await?;
        Ok(rows
            .into_iter()
            .map(|r| PriceRow {
                ticker: r.ticker,
                date: r.date,
                close: r.close,
            })
            .collect())
    }

    pub async fn get_indicator_series(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<IndicatorRow>, Report<StorageError>> {
        if tickers.is_empty() {
            return Ok(Vec::new());
        }
        debug!(?tickers, %start, %end, "executing indicator query");
        self.storage.read_series(tickers, start, end).await
    }

    /// Most recent stored row of `ticker`, if any.
    pub async fn latest_row(
        &self,
        ticker: &str,
    ) -> Result<Option<IndicatorRow>, Report<StorageError>> {
        let Some(latest) = self.storage.latest_date(ticker).await? else {
            return Ok(None);
        };
        let rows = self
            .storage
            .read_series(&[ticker.to_string()], latest, latest)
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Closes rebased to 100 at the first close of each ticker's window.
    pub async fn get_normalized_prices(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NormalizedPoint>, Report<StorageError>> {
        let rows = self.get_prices_series(tickers, start, end).await?;
        Ok(normalize(rows))
    }
}

/// Rebase each ticker's closes on its first available close in `rows`.
///
/// Rows must be ordered by date. A ticker whose base close is zero gets no
/// normalized values.
fn normalize(rows: Vec<PriceRow>) -> Vec<NormalizedPoint> {
    let mut bases: HashMap<String, f64> = HashMap::new();
    for row in &rows {
        if let Some(close) = row.close {
            bases.entry(row.ticker.clone()).or_insert(close);
        }
    }

    rows.into_iter()
        .map(|row| {
            let base = bases.get(&row.ticker).copied().filter(|b| *b != 0.0);
            let normalized = base.zip(row.close).map(|(base, close)| close / base * 100.0);
            NormalizedPoint {
                ticker: row.ticker,
                date: row.date,
                close: row.close,
                normalized,
            }
        })
        .collect()
}
