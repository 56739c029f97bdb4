//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("stale transition: {0}")]
    StaleTransition(String),

    #[error("bad cursor: {0}")]
    BadCursor(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for chengis_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => chengis_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => chengis_core::Error::Conflict(msg),
            DbError::StaleTransition(msg) => chengis_core::Error::Conflict(msg),
            DbError::BadCursor(msg) => chengis_core::Error::InvalidInput(msg),
            other => chengis_core::Error::Internal(other.to_string()),
        }
    }
}
