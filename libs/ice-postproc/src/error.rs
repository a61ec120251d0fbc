//! Post-processing error types

use ice_calc::CalcError;
use ice_model::ModelError;
use thiserror::Error;

/// Result type for post-processing operations
pub type Result<T> = std::result::Result<T, PostProcError>;

/// Post-processing errors
#[derive(Debug, Error)]
pub enum PostProcError {
    /// Invalid rule configuration, detected before any data is touched
    #[error("Configuration error: {0}")]
    Config(String),

    /// Expression evaluation failed for one hour of a rule
    #[error("Error evaluating rule {rule}, expression \"{expression}\" at hour {hour}: {message}")]
    Evaluation {
        rule: String,
        expression: String,
        hour: usize,
        message: String,
    },

    /// External input required by a rule is absent
    #[error("Missing data: {0}")]
    MissingData(String),

    /// Allocation or cluster report could not be parsed
    #[error("Report error: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Calc(#[from] CalcError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl PostProcError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn report(msg: impl Into<String>) -> Self {
        Self::Report(msg.into())
    }

    pub fn missing_data(msg: impl Into<String>) -> Self {
        Self::MissingData(msg.into())
    }
}

impl From<chrono::ParseError> for PostProcError {
    fn from(err: chrono::ParseError) -> Self {
        PostProcError::Report(format!("bad timestamp: {}", err))
    }
}
