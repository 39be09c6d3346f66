//! Error types for the store module.

use mytoken_core::{ExchangeError, MytokenId};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Blob serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The conditional usage increment matched no row: the clause ran out of
    /// quota between authorization and commit.
    #[error("usage limit of clause {clause} of mytoken {mytoken_id} reached")]
    UsageExhausted { mytoken_id: MytokenId, clause: usize },

    /// A pending-exchange transition was not possible from the current state.
    #[error("exchange: {0}")]
    Exchange(#[from] ExchangeError),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
