//! Error types for the enrichment service

use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the time-series store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Failed to decode store response: {0}")]
    Decode(String),

    #[error("Invalid timestamp: {0}")]
    Timestamp(String),
}

/// Failures loading immutable reference tables
#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("Failed to open reference file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed reference data: {0}")]
    Csv(#[from] csv::Error),

    #[error("Reference table has no usable rows: {0}")]
    Empty(String),

    #[error("Reference table is missing column '{0}'")]
    MissingColumn(String),
}

/// Failures inside a single calculator for a single record
#[derive(Debug, Error)]
pub enum CalculatorError {
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("History lookup failed: {0}")]
    History(#[from] StoreError),

    #[error("Calculation error: {0}")]
    Calculation(String),
}

/// Registration rejections. Logged by the registry, never fatal on their own.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Calculator '{0}' declares no input stream")]
    MissingInputStream(String),

    #[error("Calculator '{0}' declares no output stream")]
    MissingOutputStream(String),

    #[error("Calculator '{name}' writes to '{declared}' but input stream '{input}' already writes to '{expected}'")]
    OutputMismatch {
        name: String,
        input: String,
        declared: String,
        expected: String,
    },
}

/// Top-level service errors
#[derive(Debug, Error)]
pub enum EnricherError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("No calculators registered; nothing to enrich")]
    NoCalculators,

    #[error("Cannot compute watermark: {0}")]
    Watermark(String),

    #[error("Enrichment cycle panicked: {0}")]
    Panicked(String),
}

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
