//! Repository Module
//!
//! Free async functions over `SqliteExecutor`, so the same call works on the
//! pool and inside a transaction (`&mut *tx`).

pub mod daily_balance;
pub mod entry;
pub mod outbox;
pub mod processed_event;

use shared::error::AppError;
use thiserror::Error;

/// Repository error types
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepoError::NotFound("row".into()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                RepoError::Duplicate(db_err.message().to_string())
            }
            other => RepoError::Database(other.to_string()),
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(msg) => AppError::not_found(msg),
            RepoError::Duplicate(msg) => AppError::with_message(shared::error::ErrorCode::AlreadyExists, msg),
            RepoError::Database(msg) => AppError::database(msg),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;
