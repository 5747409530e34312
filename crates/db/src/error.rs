//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found: {0}")]
    NotFound(String),

    /// An append-only entry already exists.
    #[error("entry already exists: {0}")]
    Conflict(String),

    #[error("stored document is malformed: {0}")]
    Document(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
