use thiserror::Error;

/// Fatal, run-level failures. Row-level problems never surface here; they are
/// tallied in [`crate::model::RunErrors`] on the report instead.
#[derive(Debug, Error)]
pub enum ReconError {
    /// Batch-level input problem: empty or structurally unrecognizable.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),
    /// Config validation error (rate out of range, bad multipliers, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),
    /// CSV document could not be read.
    #[error("csv error: {0}")]
    Csv(String),
    /// The caller cancelled the run between chunks.
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconError {
    /// Stable machine-readable kind, for callers that forward errors as JSON.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ConfigParse(_) => "config_parse",
            Self::ConfigValidation(_) => "config_validation",
            Self::Csv(_) => "csv",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<csv::Error> for ReconError {
    fn from(e: csv::Error) -> Self {
        Self::Csv(e.to_string())
    }
}
