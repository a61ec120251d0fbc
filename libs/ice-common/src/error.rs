//! Common error types

use thiserror::Error;

/// Common error type used by the ice tools
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input/parameter errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("invalid configuration");
        assert_eq!(
            err.to_string(),
            "Configuration error: invalid configuration"
        );

        let err = Error::invalid_input("month must be yyyy-MM");
        assert_eq!(err.to_string(), "Invalid input: month must be yyyy-MM");
    }

    #[test]
    fn test_error_conversion() {
        let yaml_err = serde_yaml::from_str::<Vec<String>>("{not: [a list");
        assert!(yaml_err.is_err());
        let err: Error = yaml_err.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
