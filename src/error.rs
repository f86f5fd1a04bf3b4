//! Error types for the bag-scanning pipeline

use std::path::PathBuf;
use thiserror::Error;

use crate::model::FitError;

/// Errors that abort a pipeline stage
///
/// Data-quality exclusions are not errors; they are dropped rows with a
/// logged count. Only I/O, schema and configuration problems end up here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Input file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Column length mismatch for {column}: expected {expected} rows, got {actual}")]
    ColumnLength {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Empty table: {0}")]
    EmptyTable(String),

    #[error("Model fit failed for '{name}': {source}")]
    ModelFit {
        name: String,
        #[source]
        source: FitError,
    },
}
