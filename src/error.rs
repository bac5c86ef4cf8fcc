//! Error types for llm-tracelab

use std::io;
use thiserror::Error;

/// Result type alias for llm-tracelab operations
pub type Result<T> = std::result::Result<T, TraceLabError>;

/// Main error type for llm-tracelab
#[derive(Error, Debug)]
pub enum TraceLabError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file parsing errors
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Record file creation/finalization errors
    #[error("Record error: {0}")]
    Record(String),

    /// Upstream connection errors
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Startup connectivity self-check failures
    #[error("Upstream self-check failed: {0}")]
    SelfCheck(String),

    /// HTTP protocol errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Record file replay errors
    #[error("Replay error: {0}")]
    Replay(String),
}

impl From<serde_yaml::Error> for TraceLabError {
    fn from(err: serde_yaml::Error) -> Self {
        TraceLabError::ConfigParse(err.to_string())
    }
}

impl From<toml::de::Error> for TraceLabError {
    fn from(err: toml::de::Error) -> Self {
        TraceLabError::ConfigParse(err.to_string())
    }
}

impl From<reqwest::Error> for TraceLabError {
    fn from(err: reqwest::Error) -> Self {
        TraceLabError::Upstream(err.to_string())
    }
}

impl From<http::Error> for TraceLabError {
    fn from(err: http::Error) -> Self {
        TraceLabError::Http(err.to_string())
    }
}
