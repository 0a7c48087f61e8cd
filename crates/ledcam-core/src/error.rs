use thiserror::Error;

/// Top-level error type for the ledcam ingestion pipeline.
///
/// Per-file failures (`MissingField`, `InvalidField`) are contained by the
/// watcher at single-file granularity. `Config` and `Storage` errors raised
/// while opening the store are fatal to the process.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedcamError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl LedcamError {
    pub fn missing(field: &str) -> Self {
        LedcamError::MissingField {
            field: field.to_string(),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        LedcamError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for LedcamError {
    fn from(err: toml::de::Error) -> Self {
        LedcamError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for LedcamError {
    fn from(err: toml::ser::Error) -> Self {
        LedcamError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for LedcamError {
    fn from(err: serde_json::Error) -> Self {
        LedcamError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for ledcam operations.
pub type Result<T> = std::result::Result<T, LedcamError>;
