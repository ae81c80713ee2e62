mod config;
mod error;
mod indicator;
mod model;
mod narrative;
mod pipeline;
mod repository;
mod source;
mod storage;

use std::path::Path;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use narrative::{NarrativeClient, summarize_technical_state, technical_outlook};
use pipeline::{Pipeline, TickerOutcome};
use repository::Repository;
use source::PriceSource;
use source::yahoo::YahooSource;
use storage::Storage;
use storage::sqlite::SqliteStorage;

const DEFAULT_LOOKBACK_DAYS: u64 = 365;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("storage error")]
    Storage,
    #[display("price source error")]
    Source,
    #[display("runtime error")]
    Runtime,
    #[display("failed to write output")]
    Output,
}

#[derive(Parser)]
#[command(name = "equity-pulse", about = "Daily equity price and indicator pipeline")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch new daily prices, compute indicators and store them
    Ingest {
        /// Tickers to process (defaults to `ingestion.tickers` from the config)
        #[arg(short, long = "ticker")]
        tickers: Vec<String>,
    },
    /// List tickers with stored data
    Tickers,
    /// Print stored closes as JSON
    Prices(RangeArgs),
    /// Print stored closes with indicators as JSON
    Indicators(RangeArgs),
    /// Print closes rebased to 100 at the start of the range as JSON
    Normalized(RangeArgs),
    /// Print the latest technical state and an AI narrative when available
    Summary {
        #[arg(short, long)]
        ticker: String,
    },
}

#[derive(Args)]
struct RangeArgs {
    #[arg(short, long = "ticker", required = true)]
    tickers: Vec<String>,
    /// First date of the range, YYYY-MM-DD (default: one year before `--to`)
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Last date of the range, YYYY-MM-DD (default: today)
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl RangeArgs {
    fn range(&self) -> (NaiveDate, NaiveDate) {
        let to = self.to.unwrap_or_else(|| Utc::now().date_naive());
        let from = self.from.unwrap_or_else(|| {
            to.checked_sub_days(Days::new(DEFAULT_LOOKBACK_DAYS))
                .unwrap_or(NaiveDate::MIN)
        });
        (from, to)
    }
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);

    // ── Storage ───────────────────────────────────────────────────────────────
    let data_dir = &config.general.data_dir;
    std::fs::create_dir_all(data_dir)
        .change_context(AppError::Storage)
        .attach_with(|| format!("data_dir: {data_dir}"))?;

    let db_path = format!("{data_dir}/equity-pulse.db");
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(Path::new(&db_path))
            .await
            .change_context(AppError::Storage)?,
    );
    let repository = Repository::new(Arc::clone(&storage));

    match cli.command {
        Command::Ingest { tickers } => ingest(&config, storage, tickers).await,
        Command::Tickers => print_json(
            &repository
                .get_available_tickers()
                .await
                .change_context(AppError::Storage)?,
        ),
        Command::Prices(args) => {
            let (from, to) = args.range();
            print_json(
                &repository
                    .get_prices_series(&args.tickers, from, to)
                    .await
                    .change_context(AppError::Storage)?,
            )
        }
        Command::Indicators(args) => {
            let (from, to) = args.range();
            print_json(
                &repository
                    .get_indicator_series(&args.tickers, from, to)
                    .await
                    .change_context(AppError::Storage)?,
            )
        }
        Command::Normalized(args) => {
            let (from, to) = args.range();
            print_json(
                &repository
                    .get_normalized_prices(&args.tickers, from, to)
                    .await
                    .change_context(AppError::Storage)?,
            )
        }
        Command::Summary { ticker } => summary(&config, &repository, &ticker).await,
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

async fn ingest(
    config: &AppConfig,
    storage: Arc<dyn Storage>,
    tickers: Vec<String>,
) -> Result<(), Report<AppError>> {
    let tickers = if tickers.is_empty() {
        config.ingestion.tickers.clone()
    } else {
        tickers
    };

    let source: Arc<dyn PriceSource> =
        Arc::new(YahooSource::new(&config.source).change_context(AppError::Source)?);
    let pipeline = Pipeline::new(storage, source, config.ingestion.clone())
        .change_context(AppError::Runtime)?;

    let report = pipeline.run(&tickers).await;

    for (ticker, outcome) in &report.outcomes {
        let line = match outcome {
            TickerOutcome::UpToDate => "up to date".to_string(),
            TickerOutcome::NoData => "no new data".to_string(),
            TickerOutcome::Stored { fetched, inserted } => {
                format!("fetched {fetched}, inserted {inserted}")
            }
            TickerOutcome::Failed { error } => format!("FAILED: {error}"),
        };
        println!("{ticker:<12} {line}");
    }

    info!(
        run_id = %report.run_id,
        inserted = report.inserted(),
        failed = report.failed(),
        "ingest complete"
    );
    Ok(())
}

async fn summary(
    config: &AppConfig,
    repository: &Repository,
    ticker: &str,
) -> Result<(), Report<AppError>> {
    let Some(latest) = repository
        .latest_row(ticker)
        .await
        .change_context(AppError::Storage)?
    else {
        println!("no stored data for {ticker}; run `ingest` first");
        return Ok(());
    };

    println!("{}", summarize_technical_state(&latest));

    let client = NarrativeClient::from_config(&config.narrative);
    match technical_outlook(client.as_ref(), &latest).await {
        Ok(text) => println!("AI technical outlook:\n{text}"),
        Err(report) => {
            warn!(error = ?report, "narrative generation failed");
            println!("AI analysis unavailable");
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), Report<AppError>> {
    let json = serde_json::to_string_pretty(value).change_context(AppError::Output)?;
    println!("{json}");
    Ok(())
}
