//! Error types for Sikt.

use thiserror::Error;

/// Library-level error type for Sikt operations.
#[derive(Error, Debug)]
pub enum SiktError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("{0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("{0}")]
    Llm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("External tool not found: {0}. Please install it and ensure it's in your PATH.")]
    ToolNotFound(String),

    #[error("External tool failed: {0}")]
    ToolFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    ConcurrencyTimeout(&'static str),

    /// The running job was cancelled or superseded by a newer run.
    #[error("job cancelled")]
    JobCancelled,

    /// A pipeline-level failure carrying a stable error code.
    #[error("{code}: {message}")]
    Pipeline { code: &'static str, message: String },
}

impl SiktError {
    /// Shorthand for a pipeline failure with a stable code.
    pub fn pipeline(code: &'static str, message: impl Into<String>) -> Self {
        SiktError::Pipeline {
            code,
            message: message.into(),
        }
    }
}

/// Result type alias for Sikt operations.
pub type Result<T> = std::result::Result<T, SiktError>;
