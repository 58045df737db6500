//! Error types for the store layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLx error (connection, query, etc.)
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state transition
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A JSON column failed to parse into its model type
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptRow(msg.into())
    }
}
