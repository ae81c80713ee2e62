use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::error::FetchError;
use crate::model::{RawBar, RawField};
use crate::source::PriceSource;

const SOURCE_NAME: &str = "yahoo";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";
const BASE_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Daily bars from Yahoo Finance's v8 chart API.
pub struct YahooSource {
    client: reqwest::Client,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
    base_url: String,
    max_retries: u32,
}

impl YahooSource {
    pub fn new(config: &SourceConfig) -> Result<Self, Report<FetchError>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .change_context(FetchError::Request {
                source_name: SOURCE_NAME.into(),
            })?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(nonzero!(1u32));

        Ok(Self {
            client,
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    async fn fetch_chart(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ChartResponse, Report<FetchError>> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, ticker);
        let params = chart_params(start, end);

        let mut attempt = 0;
        loop {
            // Wait for rate limiter before making the request
            self.rate_limiter.until_ready().await;

            match self.request_chart(&url, &params, ticker).await {
                Ok(chart) => return Ok(chart),
                Err(report) if attempt < self.max_retries && is_transient(&report) => {
                    let delay = retry_delay(attempt);
                    warn!(
                        ticker,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %report,
                        "yahoo request failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(report) => return Err(report),
            }
        }
    }

    async fn request_chart(
        &self,
        url: &str,
        params: &[(&str, String)],
        ticker: &str,
    ) -> Result<ChartResponse, Report<FetchError>> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .change_context(FetchError::Request {
                source_name: SOURCE_NAME.into(),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Report::new(FetchError::SymbolNotFound {
                ticker: ticker.to_string(),
            }));
        }
        if !status.is_success() {
            return Err(Report::new(FetchError::Status {
                source_name: SOURCE_NAME.into(),
                status: status.as_u16(),
            }));
        }

        response
            .json()
            .await
            .change_context(FetchError::ResponseParse {
                source_name: SOURCE_NAME.into(),
            })
    }
}

impl PriceSource for YahooSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn fetch_daily(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: Option<NaiveDate>,
    ) -> BoxFuture<'_, Result<Vec<RawBar>, Report<FetchError>>> {
        let ticker = ticker.to_owned();
        Box::pin(async move {
            let end = end.unwrap_or_else(|| Utc::now().date_naive());
            if start > end {
                return Ok(Vec::new());
            }

            info!(ticker = %ticker, %start, %end, "fetching daily prices");
            let chart = self.fetch_chart(&ticker, start, end).await?;
            let bars = parse_chart(&ticker, chart, start, end, Utc::now())?;

            if bars.is_empty() {
                warn!(ticker = %ticker, "no data returned");
            } else {
                debug!(ticker = %ticker, bars = bars.len(), "daily prices fetched");
            }
            Ok(bars)
        })
    }
}

fn chart_params(start: NaiveDate, end: NaiveDate) -> Vec<(&'static str, String)> {
    let period1 = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
    // period2 is exclusive
    let period2 = end
        .checked_add_days(Days::new(1))
        .unwrap_or(end)
        .and_time(chrono::NaiveTime::MIN)
        .and_utc()
        .timestamp();

    vec![
        ("period1", period1.to_string()),
        ("period2", period2.to_string()),
        ("interval", "1d".to_string()),
        ("events", "history".to_string()),
    ]
}

/// Exponential backoff capped at [`MAX_RETRY_DELAY`].
fn retry_delay(attempt: u32) -> Duration {
    let millis = BASE_RETRY_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(millis).min(MAX_RETRY_DELAY)
}

fn is_transient(report: &Report<FetchError>) -> bool {
    match report.current_context() {
        FetchError::Request { .. } => true,
        FetchError::Status { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
        }
        FetchError::ResponseParse { .. } | FetchError::SymbolNotFound { .. } => false,
    }
}

/// Turn a chart response into ascending, date-unique bars within `[start, end]`.
///
/// A bar for a session that has not closed yet as of `now` is dropped: its
/// close is still moving, and a stored row is never rewritten.
fn parse_chart(
    ticker: &str,
    resp: ChartResponse,
    start: NaiveDate,
    end: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Vec<RawBar>, Report<FetchError>> {
    let parse_error = || FetchError::ResponseParse {
        source_name: SOURCE_NAME.into(),
    };

    let Some(data) = resp.chart.result.and_then(|r| r.into_iter().next()) else {
        return match resp.chart.error {
            Some(err) if err.code == "Not Found" => Err(Report::new(FetchError::SymbolNotFound {
                ticker: ticker.to_string(),
            })),
            Some(err) => Err(Report::new(parse_error())
                .attach(format!("{}: {}", err.code, err.description))),
            None => Ok(Vec::new()),
        };
    };

    // A range without trading days comes back without timestamps.
    let Some(timestamps) = data.timestamp else {
        return Ok(Vec::new());
    };

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| Report::new(parse_error()).attach("no quote data"))?;

    let meta = data.meta.unwrap_or_default();
    let offset = meta.gmtoffset.unwrap_or(0);
    let open_session = meta
        .current_trading_period
        .map(|period| period.regular)
        .filter(|session| now.timestamp() < session.end)
        .and_then(|session| DateTime::from_timestamp(session.start + offset, 0))
        .map(|dt| dt.date_naive());

    let mut bars = Vec::with_capacity(timestamps.len());

    for (i, &ts) in timestamps.iter().enumerate() {
        // Dates are taken in exchange-local time
        let date = DateTime::from_timestamp(ts + offset, 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| Report::new(parse_error()).attach(format!("invalid timestamp: {ts}")))?;

        if date < start || date > end {
            continue;
        }
        if open_session == Some(date) {
            debug!(ticker, %date, "skipping bar of a session still in progress");
            continue;
        }

        let open = quote.open.get(i).copied().flatten();
        let high = quote.high.get(i).copied().flatten();
        let low = quote.low.get(i).copied().flatten();
        let close = quote.close.get(i).cloned().unwrap_or(RawField::Null);
        let volume = quote.volume.get(i).copied().flatten();

        // Skip bars where every field is empty (holidays/non-trading days)
        if open.is_none()
            && high.is_none()
            && low.is_none()
            && close == RawField::Null
            && volume.is_none()
        {
            continue;
        }

        bars.push(RawBar {
            date,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    // The live session can be reported twice; keep the latest entry per date.
    bars.sort_by_key(|b| b.date);
    bars.reverse();
    bars.dedup_by_key(|b| b.date);
    bars.reverse();

    Ok(bars)
}

// ── REST response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    gmtoffset: Option<i64>,
    current_trading_period: Option<TradingPeriods>,
}

#[derive(Debug, Deserialize)]
struct TradingPeriods {
    regular: TradingPeriod,
}

/// Session bounds as unix timestamps.
#[derive(Debug, Deserialize)]
struct TradingPeriod {
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<RawField>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}
