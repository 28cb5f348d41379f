//! Error types for keepsake-memory

use thiserror::Error;

/// Result type alias for keepsake-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in keepsake-memory
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector database error: {0}")]
    VectorDb(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Content looked like it carried credential material. The write was
    /// rejected, nothing was persisted.
    #[error("Secret detected in content ({kind}); write rejected")]
    SecretDetected { kind: String },

    #[error("Type '{item_type}' cannot be promoted to the durable tier")]
    UnsupportedPromotion { item_type: String },

    #[error("Refusing to remove '{0}' without confirmation")]
    ConfirmationRequired(String),

    #[error("Summarization backend error: {0}")]
    Backend(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    pub fn vector_db(msg: impl Into<String>) -> Self {
        Self::VectorDb(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}
