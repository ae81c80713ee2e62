pub mod sqlite;

use chrono::NaiveDate;
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::model::{IndicatorRow, PriceRow};

/// Ticker+date keyed store of daily prices and their indicators.
pub trait Storage: Send + Sync {
    /// Insert rows in one transaction. Rows whose (ticker, date) already
    /// exists are skipped, never updated. Returns the number inserted.
    fn upsert_rows(
        &self,
        rows: &[IndicatorRow],
    ) -> BoxFuture<'_, Result<u64, Report<StorageError>>>;

    fn latest_date(
        &self,
        ticker: &str,
    ) -> BoxFuture<'_, Result<Option<NaiveDate>, Report<StorageError>>>;

    /// Up to `limit` rows for `ticker` dated strictly before `before`,
    /// oldest first.
    fn recent_rows(
        &self,
        ticker: &str,
        before: NaiveDate,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<PriceRow>, Report<StorageError>>>;

    /// Rows for any of `tickers` within `[start, end]`, ordered by date.
    fn read_series(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<IndicatorRow>, Report<StorageError>>>;

    fn available_tickers(&self) -> BoxFuture<'_, Result<Vec<String>, Report<StorageError>>>;
}
