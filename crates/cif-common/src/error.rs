//! Error types for CIF

use thiserror::Error;

/// Result type alias for CIF operations
pub type Result<T> = std::result::Result<T, CifError>;

/// Main error type for CIF
#[derive(Error, Debug)]
pub enum CifError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Pipeline error in {stage}: {message}")]
    Pipeline { stage: String, message: String },
}

impl CifError {
    /// Build a pipeline error attributed to a named meta-fetcher or plugin
    pub fn pipeline(stage: impl Into<String>, message: impl Into<String>) -> Self {
        CifError::Pipeline {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
