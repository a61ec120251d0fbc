//! Model Layer Error Types

use thiserror::Error;

/// Result type for ice-model operations
pub type Result<T> = std::result::Result<T, ModelError>;

/// Model layer errors
#[derive(Debug, Error)]
pub enum ModelError {
    /// Unknown dimension name
    #[error("Unknown tag key: {0}")]
    UnknownTagKey(String),

    /// Data set parsing error
    #[error("Data parsing error: {0}")]
    Parse(String),

    /// Invalid month or timestamp
    #[error("Invalid date: {0}")]
    InvalidDate(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl ModelError {
    pub fn parse(msg: impl Into<String>) -> Self {
        ModelError::Parse(msg.into())
    }

    pub fn invalid_date(msg: impl Into<String>) -> Self {
        ModelError::InvalidDate(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::UnknownTagKey("color".to_string());
        assert_eq!(err.to_string(), "Unknown tag key: color");

        let err = ModelError::parse("bad hour");
        assert_eq!(err.to_string(), "Data parsing error: bad hour");
    }
}
