use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use error_stack::{Report, ResultExt};
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::error::{IndicatorError, PipelineError};
use crate::indicator::{IndicatorSet, compute_indicators};
use crate::model::{PriceRow, RawBar};
use crate::source::PriceSource;
use crate::storage::Storage;

/// How much history a ticker needs, decided once per run from its latest
/// stored date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Nothing stored yet: backfill from the epoch floor.
    Cold,
    /// Stored through `last`: fetch only what came after it.
    Warm { last: NaiveDate },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub mode: FetchMode,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FetchPlan {
    /// True when the window is empty, e.g. a WARM ticker already stored
    /// through today.
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Decide the fetch window for one ticker.
pub fn plan(latest: Option<NaiveDate>, today: NaiveDate, epoch_floor: NaiveDate) -> FetchPlan {
    match latest {
        None => FetchPlan {
            mode: FetchMode::Cold,
            start: epoch_floor,
            end: today,
        },
        Some(last) => FetchPlan {
            mode: FetchMode::Warm { last },
            start: last.checked_add_days(Days::new(1)).unwrap_or(last),
            end: today,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickerOutcome {
    /// Stored data already reaches today; the source was not asked.
    UpToDate,
    /// The source had nothing new for the window.
    NoData,
    Stored { fetched: usize, inserted: u64 },
    Failed { error: String },
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcomes: Vec<(String, TickerOutcome)>,
}

impl RunReport {
    pub fn inserted(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|(_, outcome)| match outcome {
                TickerOutcome::Stored { inserted, .. } => *inserted,
                _ => 0,
            })
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TickerOutcome::Failed { .. }))
            .count()
    }
}

/// Fetch -> compute -> store, one ticker at a time.
pub struct Pipeline {
    storage: Arc<dyn Storage>,
    source: Arc<dyn PriceSource>,
    settings: IngestionConfig,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        source: Arc<dyn PriceSource>,
        settings: IngestionConfig,
    ) -> Result<Self, Report<IndicatorError>> {
        let needed = IndicatorSet::standard()?.max_lookback();
        if settings.history_buffer < needed {
            warn!(
                history_buffer = settings.history_buffer,
                needed,
                "history buffer shorter than the longest indicator window; \
                 the first rows of incremental loads will carry partial indicators"
            );
        }
        Ok(Self {
            storage,
            source,
            settings,
        })
    }

    pub async fn run(&self, tickers: &[String]) -> RunReport {
        self.run_as_of(tickers, Utc::now().date_naive()).await
    }

    /// Process every ticker sequentially against a fixed `today`. A failing
    /// ticker is logged and reported; it never stops the batch.
    pub async fn run_as_of(&self, tickers: &[String], today: NaiveDate) -> RunReport {
        let run_id = Uuid::new_v4();
        let mut outcomes = Vec::with_capacity(tickers.len());

        for ticker in tickers {
            let span = info_span!("ticker", %run_id, ticker = %ticker);
            let outcome = async {
                info!(source = self.source.name(), "starting pipeline");
                match self.process_ticker(ticker, today).await {
                    Ok(outcome) => {
                        info!(?outcome, "pipeline completed");
                        outcome
                    }
                    Err(report) => {
                        error!(error = ?report, "pipeline failed (continuing)");
                        TickerOutcome::Failed {
                            error: report.to_string(),
                        }
                    }
                }
            }
            .instrument(span)
            .await;
            outcomes.push((ticker.clone(), outcome));
        }

        let report = RunReport { run_id, outcomes };
        info!(
            %run_id,
            tickers = tickers.len(),
            inserted = report.inserted(),
            failed = report.failed(),
            "ingestion run finished"
        );
        report
    }

    async fn process_ticker(
        &self,
        ticker: &str,
        today: NaiveDate,
    ) -> Result<TickerOutcome, Report<PipelineError>> {
        let storage_error = || PipelineError::Storage {
            ticker: ticker.to_string(),
        };

        let latest = self
            .storage
            .latest_date(ticker)
            .await
            .change_context(storage_error())?;

        let plan = plan(latest, today, self.settings.epoch_floor);
        match plan.mode {
            FetchMode::Cold => info!(start = %plan.start, "no stored history, full backfill"),
            FetchMode::Warm { last } => info!(%last, start = %plan.start, "incremental load"),
        }

        if plan.is_empty() {
            return Ok(TickerOutcome::UpToDate);
        }

        let bars = self
            .source
            .fetch_daily(ticker, plan.start, Some(plan.end))
            .await
            .change_context(PipelineError::Fetch {
                ticker: ticker.to_string(),
            })?;

        let fetched = bars.len();
        let new_rows = prepare_rows(ticker, &bars, latest);
        if new_rows.is_empty() {
            info!(fetched, "no new rows to insert");
            return Ok(TickerOutcome::NoData);
        }

        let missing = new_rows.iter().filter(|r| r.close.is_none()).count();
        if missing > 0 {
            warn!(missing, "rows with unparseable close; their indicators stay empty");
        }

        let history = match plan.mode {
            FetchMode::Warm { .. } if self.settings.history_buffer > 0 => self
                .storage
                .recent_rows(ticker, new_rows[0].date, self.settings.history_buffer)
                .await
                .change_context(storage_error())?,
            _ => Vec::new(),
        };

        let offset = history.len();
        let mut series = history;
        series.extend(new_rows);

        let computed = compute_indicators(&series).change_context(PipelineError::Indicator {
            ticker: ticker.to_string(),
        })?;

        let inserted = self
            .storage
            .upsert_rows(&computed[offset..])
            .await
            .change_context(storage_error())?;

        info!(
            fetched,
            history = offset,
            inserted,
            "rows stored"
        );

        Ok(TickerOutcome::Stored { fetched, inserted })
    }
}

/// Parse closes and keep one row per date, ascending, strictly after `latest`.
/// A date reported more than once keeps its last bar.
fn prepare_rows(ticker: &str, bars: &[RawBar], latest: Option<NaiveDate>) -> Vec<PriceRow> {
    let mut rows: Vec<PriceRow> = bars
        .iter()
        .filter(|bar| latest.is_none_or(|last| bar.date > last))
        .map(|bar| PriceRow::from_raw(ticker, bar))
        .collect();
    rows.sort_by_key(|r| r.date);
    rows.reverse();
    rows.dedup_by_key(|r| r.date);
    rows.reverse();
    rows
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use futures::future::BoxFuture;

    use super::*;
    use crate::error::FetchError;
    use crate::indicator::rows_from_closes;
    use crate::model::RawField;
    use crate::storage::sqlite::SqliteStorage;

    /// Serves a fixed history per ticker, filtered to the requested window.
    #[derive(Default)]
    struct StubSource {
        history: HashMap<String, Vec<RawBar>>,
        failing: Vec<String>,
        calls: Mutex<Vec<(String, NaiveDate, Option<NaiveDate>)>>,
    }

    impl StubSource {
        fn with_closes(mut self, ticker: &str, closes: &[Option<f64>]) -> Self {
            let bars = rows_from_closes(ticker, closes)
                .into_iter()
                .map(|row| RawBar {
                    date: row.date,
                    open: None,
                    high: None,
                    low: None,
                    close: row.close.map_or(RawField::Text("n/a".into()), RawField::Number),
                    volume: None,
                })
                .collect();
            self.history.insert(ticker.to_string(), bars);
            self
        }

        fn failing(mut self, ticker: &str) -> Self {
            self.failing.push(ticker.to_string());
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl PriceSource for StubSource {
        fn name(&self) -> &str {
            "stub"
        }

        fn fetch_daily(
            &self,
            ticker: &str,
            start: NaiveDate,
            end: Option<NaiveDate>,
        ) -> BoxFuture<'_, Result<Vec<RawBar>, Report<FetchError>>> {
            self.calls
                .lock()
                .unwrap()
                .push((ticker.to_string(), start, end));
            let result = if self.failing.iter().any(|t| t == ticker) {
                Err(Report::new(FetchError::Request {
                    source_name: "stub".into(),
                }))
            } else {
                Ok(self
                    .history
                    .get(ticker)
                    .map(|bars| {
                        bars.iter()
                            .filter(|b| b.date >= start && end.is_none_or(|e| b.date <= e))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default())
            };
            Box::pin(async move { result })
        }
    }

    fn day(offset: u64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Days::new(offset)
    }

    fn settings(history_buffer: usize) -> IngestionConfig {
        IngestionConfig {
            tickers: vec!["ABC".into()],
            epoch_floor: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
            history_buffer,
        }
    }

    fn rising(n: usize) -> Vec<Option<f64>> {
        (0..n).map(|i| Some(100.0 + i as f64)).collect()
    }

    fn wavy(n: usize) -> Vec<Option<f64>> {
        (0..n)
            .map(|i| Some(100.0 + ((i * 7) % 13) as f64 - ((i * 3) % 5) as f64))
            .collect()
    }

    async fn setup(
        source: StubSource,
        history_buffer: usize,
    ) -> (Pipeline, Arc<SqliteStorage>, Arc<StubSource>) {
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let source = Arc::new(source);
        let pipeline = Pipeline::new(
            storage.clone(),
            source.clone(),
            settings(history_buffer),
        )
        .unwrap();
        (pipeline, storage, source)
    }

    async fn stored(storage: &SqliteStorage, ticker: &str) -> Vec<crate::model::IndicatorRow> {
        storage
            .read_series(&[ticker.to_string()], day(0), day(1000))
            .await
            .unwrap()
    }

    fn tickers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cold_plan_starts_at_epoch_floor() {
        let floor = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        let plan = plan(None, day(10), floor);
        assert_eq!(plan.mode, FetchMode::Cold);
        assert_eq!(plan.start, floor);
        assert_eq!(plan.end, day(10));
        assert!(!plan.is_empty());
    }

    #[test]
    fn warm_plan_starts_day_after_latest() {
        let plan = plan(Some(day(4)), day(10), day(0));
        assert_eq!(plan.mode, FetchMode::Warm { last: day(4) });
        assert_eq!(plan.start, day(5));
        assert_eq!(plan.end, day(10));
    }

    #[test]
    fn warm_plan_through_today_is_empty() {
        assert!(plan(Some(day(10)), day(10), day(0)).is_empty());
    }

    #[test]
    fn prepare_rows_keeps_last_bar_per_date_and_drops_stored_dates() {
        let bar = |d: u64, close: f64| RawBar {
            date: day(d),
            open: None,
            high: None,
            low: None,
            close: RawField::Number(close),
            volume: None,
        };
        let bars = vec![bar(3, 3.0), bar(1, 1.0), bar(2, 2.0), bar(3, 30.0), bar(0, 0.5)];
        let rows = prepare_rows("ABC", &bars, Some(day(0)));
        let dates: Vec<_> = rows.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![day(1), day(2), day(3)]);
        assert_eq!(rows[2].close, Some(30.0));
    }

    #[tokio::test]
    async fn cold_run_loads_full_history() {
        let (pipeline, storage, source) =
            setup(StubSource::default().with_closes("ABC", &rising(20)), 49).await;

        let report = pipeline.run_as_of(&tickers(&["ABC"]), day(19)).await;
        assert_eq!(
            report.outcomes,
            vec![(
                "ABC".to_string(),
                TickerOutcome::Stored {
                    fetched: 20,
                    inserted: 20
                }
            )]
        );

        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(
                "ABC".to_string(),
                NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
                Some(day(19))
            )]
        );

        let rows = stored(&storage, "ABC").await;
        assert_eq!(rows.len(), 20);
        assert!(rows[..4].iter().all(|r| r.ma_5.is_none()));
        assert!(rows[4..].iter().all(|r| r.ma_5.is_some()));
    }

    #[tokio::test]
    async fn warm_run_without_new_data_inserts_nothing() {
        let (pipeline, storage, source) =
            setup(StubSource::default().with_closes("ABC", &rising(20)), 49).await;
        pipeline.run_as_of(&tickers(&["ABC"]), day(19)).await;

        // a later day with no new bars upstream
        let report = pipeline.run_as_of(&tickers(&["ABC"]), day(22)).await;
        assert_eq!(report.outcomes[0].1, TickerOutcome::NoData);
        assert_eq!(report.inserted(), 0);
        assert_eq!(source.call_count(), 2);
        assert_eq!(stored(&storage, "ABC").await.len(), 20);
    }

    #[tokio::test]
    async fn warm_run_on_same_day_skips_fetch() {
        let (pipeline, _storage, source) =
            setup(StubSource::default().with_closes("ABC", &rising(20)), 49).await;
        pipeline.run_as_of(&tickers(&["ABC"]), day(19)).await;

        let report = pipeline.run_as_of(&tickers(&["ABC"]), day(19)).await;
        assert_eq!(report.outcomes[0].1, TickerOutcome::UpToDate);
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn repeated_runs_are_idempotent() {
        let (pipeline, storage, _source) =
            setup(StubSource::default().with_closes("ABC", &wavy(70)), 49).await;

        pipeline.run_as_of(&tickers(&["ABC"]), day(69)).await;
        let first = stored(&storage, "ABC").await;
        pipeline.run_as_of(&tickers(&["ABC"]), day(69)).await;
        pipeline.run_as_of(&tickers(&["ABC"]), day(75)).await;
        let second = stored(&storage, "ABC").await;

        assert_eq!(first.len(), 70);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn incremental_run_matches_full_recompute_with_history_buffer() {
        let closes = wavy(90);
        let (pipeline, storage, _source) =
            setup(StubSource::default().with_closes("ABC", &closes), 49).await;

        pipeline.run_as_of(&tickers(&["ABC"]), day(59)).await;
        let report = pipeline.run_as_of(&tickers(&["ABC"]), day(89)).await;
        assert_eq!(
            report.outcomes[0].1,
            TickerOutcome::Stored {
                fetched: 30,
                inserted: 30
            }
        );

        let expected = compute_indicators(&rows_from_closes("ABC", &closes)).unwrap();
        let actual = stored(&storage, "ABC").await;
        assert_eq!(actual.len(), 90);
        for (a, e) in actual.iter().zip(&expected) {
            assert_eq!(a.date, e.date);
            for (got, want) in [
                (a.ma_5, e.ma_5),
                (a.ma_20, e.ma_20),
                (a.ma_50, e.ma_50),
                (a.rsi, e.rsi),
                (a.daily_return, e.daily_return),
            ] {
                match (got, want) {
                    (Some(g), Some(w)) => assert!((g - w).abs() < 1e-9, "{}: {g} != {w}", a.date),
                    (g, w) => assert_eq!(g, w, "{}", a.date),
                }
            }
        }
    }

    #[tokio::test]
    async fn zero_history_buffer_computes_over_fetched_rows_only() {
        let (pipeline, storage, _source) =
            setup(StubSource::default().with_closes("ABC", &wavy(90)), 0).await;

        pipeline.run_as_of(&tickers(&["ABC"]), day(59)).await;
        pipeline.run_as_of(&tickers(&["ABC"]), day(89)).await;

        let rows = stored(&storage, "ABC").await;
        // the first new row starts a fresh series
        assert!(rows[60].daily_return.is_none());
        assert!(rows[60..].iter().all(|r| r.ma_50.is_none()));
    }

    #[tokio::test]
    async fn failing_ticker_does_not_stop_the_batch() {
        let source = StubSource::default()
            .with_closes("ABC", &rising(10))
            .failing("BAD");
        let (pipeline, storage, _source) = setup(source, 49).await;

        let report = pipeline
            .run_as_of(&tickers(&["BAD", "ABC", "NONE"]), day(9))
            .await;

        assert!(matches!(report.outcomes[0].1, TickerOutcome::Failed { .. }));
        assert_eq!(
            report.outcomes[1].1,
            TickerOutcome::Stored {
                fetched: 10,
                inserted: 10
            }
        );
        assert_eq!(report.outcomes[2].1, TickerOutcome::NoData);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.inserted(), 10);
        assert_eq!(stored(&storage, "ABC").await.len(), 10);
    }

    #[tokio::test]
    async fn malformed_close_is_stored_as_missing() {
        let mut closes = rising(8);
        closes[3] = None;
        let (pipeline, storage, _source) =
            setup(StubSource::default().with_closes("ABC", &closes), 49).await;

        let report = pipeline.run_as_of(&tickers(&["ABC"]), day(7)).await;
        assert_eq!(report.inserted(), 8);

        let rows = stored(&storage, "ABC").await;
        assert_eq!(rows[3].close, None);
        assert_eq!(rows[3].daily_return, None);
        assert_eq!(rows[4].daily_return, None);
        assert!(rows[5].daily_return.is_some());
    }
}
