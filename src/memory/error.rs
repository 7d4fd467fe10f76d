//! Error taxonomy of the graph memory engine.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("entity '{0}' already exists")]
    DuplicateEntity(String),

    #[error("entity '{0}' does not exist")]
    UnknownEntity(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("schema initialization failed: {0}")]
    Schema(StoreError),
}

impl MemoryError {
    /// Stable category reported to callers next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            MemoryError::Validation(_) => "VALIDATION_ERROR",
            MemoryError::DuplicateEntity(_) => "DUPLICATE_ENTITY",
            MemoryError::UnknownEntity(_) => "UNKNOWN_ENTITY",
            MemoryError::Store(_) => "STORE_ERROR",
            MemoryError::Schema(_) => "SCHEMA_ERROR",
        }
    }
}
