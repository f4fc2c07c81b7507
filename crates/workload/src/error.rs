//! Workload error types.

use std::path::PathBuf;

use common::MoneyParseError;
use saga::SagaError;
use store::StoreError;
use thiserror::Error;

/// A command stream record that could not be read. Ends that stream.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: unknown command '{tag}'")]
    UnknownCommand { line: usize, tag: String },

    #[error("line {line}: '{tag}' expects {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        tag: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("line {line}: field '{field}' is not a valid number: '{value}'")]
    InvalidField {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: {source}")]
    InvalidAmount {
        line: usize,
        #[source]
        source: MoneyParseError,
    },

    #[error("line {line}: order declares {expected} lines but the stream ends after {found}")]
    TruncatedOrder {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("I/O error reading commands: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the driver and the binary.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode report: {0}")]
    Report(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker {worker} ({}) stopped without a result", path.display())]
    WorkerLost { worker: usize, path: PathBuf },
}

pub type Result<T> = std::result::Result<T, WorkloadError>;
