use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum FetchError {
    #[display("request to {source_name} failed")]
    Request { source_name: String },
    #[display("{source_name} answered with HTTP {status}")]
    Status { source_name: String, status: u16 },
    #[display("failed to parse response from {source_name}")]
    ResponseParse { source_name: String },
    #[display("symbol not found: {ticker}")]
    SymbolNotFound { ticker: String },
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}

#[derive(Debug, Display, Error)]
pub enum PipelineError {
    #[display("fetch failed for {ticker}")]
    Fetch { ticker: String },
    #[display("storage failed for {ticker}")]
    Storage { ticker: String },
    #[display("indicator computation failed for {ticker}")]
    Indicator { ticker: String },
}

#[derive(Debug, Display, Error)]
pub enum NarrativeError {
    #[display("narrative service unavailable")]
    Unavailable,
    #[display("narrative request failed")]
    Request,
    #[display("failed to parse narrative response")]
    ResponseParse,
}
