use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDate;
use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_epoch_floor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn default_history_buffer() -> usize {
    49
}

fn default_source_base_url() -> String {
    "https://query2.finance.yahoo.com".into()
}

fn default_requests_per_second() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_narrative_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_temperature() -> f64 {
    0.3
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub narrative: NarrativeConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    pub tickers: Vec<String>,
    /// First date requested for a ticker with no stored history, `"YYYY-MM-DD"`.
    #[serde(default = "default_epoch_floor")]
    pub epoch_floor: NaiveDate,
    /// Stored rows re-read before an incremental window to warm up the
    /// rolling indicators. `0` computes over the fetched rows only.
    #[serde(default = "default_history_buffer")]
    pub history_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_base_url")]
    pub base_url: String,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_source_base_url(),
            requests_per_second: default_requests_per_second(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NarrativeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_narrative_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_narrative_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            api_key_env: default_api_key_env(),
        }
    }
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_log_format(config)?;
    validate_tickers(config)?;
    validate_source(config)?;
    validate_narrative(config)?;
    Ok(())
}

fn validate_log_format(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if !VALID_LOG_FORMATS.contains(&config.general.log_format.as_str()) {
        return Err(Report::new(ConfigError::Validation {
            field: format!(
                "general.log_format \"{}\" is not one of {VALID_LOG_FORMATS:?}",
                config.general.log_format
            ),
        }));
    }
    Ok(())
}

fn validate_tickers(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let tickers = &config.ingestion.tickers;
    if tickers.is_empty() {
        return Err(Report::new(ConfigError::Validation {
            field: "ingestion.tickers must not be empty".into(),
        }));
    }

    let mut seen = HashSet::new();
    for ticker in tickers {
        if ticker.trim().is_empty() {
            return Err(Report::new(ConfigError::Validation {
                field: "ingestion.tickers: blank ticker".into(),
            }));
        }
        if !seen.insert(ticker.as_str()) {
            return Err(Report::new(ConfigError::Validation {
                field: format!("ingestion.tickers: duplicate ticker \"{ticker}\""),
            }));
        }
    }
    Ok(())
}

fn validate_source(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.source.requests_per_second == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "source.requests_per_second must be > 0".into(),
        }));
    }
    if config.source.timeout_secs == 0 {
        return Err(Report::new(ConfigError::Validation {
            field: "source.timeout_secs must be > 0".into(),
        }));
    }
    Ok(())
}

fn validate_narrative(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    let temperature = config.narrative.temperature;
    if !(0.0..=2.0).contains(&temperature) {
        return Err(Report::new(ConfigError::Validation {
            field: format!("narrative.temperature {temperature} is outside [0, 2]"),
        }));
    }
    Ok(())
}
