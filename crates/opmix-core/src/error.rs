//! Error types for OpMix.

use thiserror::Error;

/// Main error type for OpMix operations.
#[derive(Error, Debug)]
pub enum OpMixError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Backend error: {op} failed with code {code}")]
    Backend { op: &'static str, code: i32 },

    #[error("Audio engine is not initialized")]
    NotInitialized,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for OpMix operations.
pub type Result<T> = std::result::Result<T, OpMixError>;
