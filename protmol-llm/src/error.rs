//! Error types for protmol-llm

use std::io;
use std::path::PathBuf;

/// Fatal problems with the run configuration, raised before any training resource is allocated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid loss function {0:?}. Please use \"crossentropy\"")]
    UnsupportedLoss(String),

    #[error("Invalid optimizer {0:?}. Please use \"Adam\"")]
    UnsupportedOptimizer(String),

    #[error("Invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Problems loading or addressing the paired dataset.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Column not found: {0}")]
    MissingColumn(String),

    #[error("Dataset columns are misaligned: {proteins} proteins vs {molecules} molecules")]
    LengthMismatch { proteins: usize, molecules: usize },

    #[error("Sample index {index} out of range for dataset of {len} pairs")]
    IndexOutOfRange { index: usize, len: usize },
}
