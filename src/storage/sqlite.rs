use chrono::NaiveDate;
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    QueryBuilder, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::path::Path;
use std::str::FromStr;

use crate::error::StorageError;
use crate::model::{IndicatorRow, PriceRow};
use crate::storage::Storage;

const DATE_FORMAT: &str = "%Y-%m-%d";

type IndicatorRecord = (
    String,
    String,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
);

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, Report<StorageError>> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) async fn in_memory() -> Self {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap();
        Self::migrate(pool).await.unwrap()
    }
}

impl Storage for SqliteStorage {
    fn upsert_rows(
        &self,
        rows: &[IndicatorRow],
    ) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
        let rows = rows.to_vec();
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .change_context(StorageError::Insert)?;

            let mut inserted = 0;
            for r in &rows {
                let result = sqlx::query(
                    "INSERT INTO daily_prices \
                     (ticker, date, close, ma_5, ma_20, ma_50, rsi, daily_return) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT (ticker, date) DO NOTHING",
                )
                .bind(&r.ticker)
                .bind(r.date.format(DATE_FORMAT).to_string())
                .bind(r.close)
                .bind(r.ma_5)
                .bind(r.ma_20)
                .bind(r.ma_50)
                .bind(r.rsi)
                .bind(r.daily_return)
                .execute(&mut *tx)
                .await
                .change_context(StorageError::Insert)
                .attach_with(|| format!("row: {} {}", r.ticker, r.date))?;
                inserted += result.rows_affected();
            }

            tx.commit().await.change_context(StorageError::Insert)?;
            Ok(inserted)
        })
    }

    fn latest_date(
        &self,
        ticker: &str,
    ) -> BoxFuture<'_, Result<Option<NaiveDate>, Report<StorageError>>> {
        let ticker = ticker.to_string();
        Box::pin(async move {
            let (latest,): (Option<String>,) =
                sqlx::query_as("SELECT MAX(date) FROM daily_prices WHERE ticker = ?")
                    .bind(&ticker)
                    .fetch_one(&self.pool)
                    .await
                    .change_context(StorageError::Query)?;

            latest.as_deref().map(parse_date).transpose()
        })
    }

    fn recent_rows(
        &self,
        ticker: &str,
        before: NaiveDate,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<PriceRow>, Report<StorageError>>> {
        let ticker = ticker.to_string();
        Box::pin(async move {
            let records: Vec<(String, String, Option<f64>)> = sqlx::query_as(
                "SELECT ticker, date, close FROM daily_prices \
                 WHERE ticker = ? AND date < ? \
                 ORDER BY date DESC \
                 LIMIT ?",
            )
            .bind(&ticker)
            .bind(before.format(DATE_FORMAT).to_string())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            let mut rows = records
                .into_iter()
                .map(|(ticker, date, close)| {
                    parse_date(&date).map(|date| PriceRow {
                        ticker,
                        date,
                        close,
                    })
                })
                .collect::<Result<Vec<_>, Report<StorageError>>>()?;

            // Return in ascending chronological order (oldest first)
            rows.reverse();
            Ok(rows)
        })
    }

    fn read_series(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> BoxFuture<'_, Result<Vec<IndicatorRow>, Report<StorageError>>> {
        let tickers = tickers.to_vec();
        Box::pin(async move {
            if tickers.is_empty() {
                return Ok(Vec::new());
            }

            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT ticker, date, close, ma_5, ma_20, ma_50, rsi, daily_return \
                 FROM daily_prices WHERE ticker IN (",
            );
            let mut separated = builder.separated(", ");
            for ticker in &tickers {
                separated.push_bind(ticker.clone());
            }
            builder
                .push(") AND date BETWEEN ")
                .push_bind(start.format(DATE_FORMAT).to_string())
                .push(" AND ")
                .push_bind(end.format(DATE_FORMAT).to_string())
                .push(" ORDER BY date ASC, ticker ASC");

            let records: Vec<IndicatorRecord> = builder
                .build_query_as::<IndicatorRecord>()
                .fetch_all(&self.pool)
                .await
                .change_context(StorageError::Query)?;

            records.into_iter().map(map_indicator_record).collect()
        })
    }

    fn available_tickers(&self) -> BoxFuture<'_, Result<Vec<String>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT DISTINCT ticker FROM daily_prices ORDER BY ticker")
                    .fetch_all(&self.pool)
                    .await
                    .change_context(StorageError::Query)?;

            Ok(rows.into_iter().map(|(ticker,)| ticker).collect())
        })
    }
}

fn map_indicator_record(
    (ticker, date, close, ma_5, ma_20, ma_50, rsi, daily_return): IndicatorRecord,
) -> Result<IndicatorRow, Report<StorageError>> {
    Ok(IndicatorRow {
        ticker,
        date: parse_date(&date)?,
        close,
        ma_5,
        ma_20,
        ma_50,
        rsi,
        daily_return,
    })
}

fn parse_date(value: &str) -> Result<NaiveDate, Report<StorageError>> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .change_context(StorageError::Query)
        .attach_with(|| format!("stored date is malformed: {value}"))
}
