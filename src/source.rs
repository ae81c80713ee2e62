pub mod yahoo;

use chrono::NaiveDate;
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::FetchError;
use crate::model::RawBar;

/// Abstraction over a daily equity price provider.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn PriceSource`).
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch daily bars for `ticker` from `start` through `end` (today when
    /// omitted), inclusive.
    ///
    /// Bars come back in ascending date order with one bar per date. A period
    /// without trading yields an empty vector, not an error.
    fn fetch_daily(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: Option<NaiveDate>,
    ) -> BoxFuture<'_, Result<Vec<RawBar>, Report<FetchError>>>;
}
