use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PrepError {
    #[error("malformed matrix file: {0}")]
    Format(String),

    #[error("unrecognized protocol label: {0}")]
    UnrecognizedLabel(String),

    #[error("labels found in matrix ({found}) conflict with expected labels ({expected})")]
    InconsistentLabels { found: String, expected: String },

    #[error("matrix service error: {0}")]
    RemoteService(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("invalid downsample fraction: {0}")]
    InvalidFraction(f64),

    #[error("matrix skipped: {0}")]
    Skipped(String),

    #[error("unrecognized matrix source: {0}")]
    UnknownSource(String),

    #[error("missing config file matrix-prep.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),
}

impl PrepError {
    pub fn skip(reason: impl Into<String>) -> Self {
        PrepError::Skipped(reason.into())
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, PrepError::Skipped(_))
    }
}
