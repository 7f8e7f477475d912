//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),

    /// The backend could not take a lock in time; the operation may be
    /// retried.
    #[error("database busy: {0}")]
    Busy(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// SQLite `SQLITE_BUSY`, `SQLITE_LOCKED` and their extended codes, Postgres
/// `serialization_failure` and `deadlock_detected`.
const BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517", "40001", "40P01"];

impl DbError {
    /// Map an insert failure, turning unique-constraint violations into
    /// `Duplicate`.
    pub(crate) fn on_insert(err: sqlx::Error, what: impl FnOnce() -> String) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what()),
            _ => err.into(),
        }
    }

    /// Whether repeating the operation with fresh state can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Duplicate(_) | DbError::Busy(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db)
                if db.code().is_some_and(|code| BUSY_CODES.contains(&&*code)) =>
            {
                DbError::Busy(db.message().to_string())
            }
            _ => DbError::Database(err),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for keel_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => keel_core::Error::NotFound(msg),
            DbError::Duplicate(msg) => keel_core::Error::ConstraintViolation(msg),
            DbError::InvalidArgument(msg) => keel_core::Error::InvalidArgument(msg),
            DbError::Corrupt(msg) => keel_core::Error::Internal(msg),
            DbError::UnsupportedUrl(msg) => keel_core::Error::InvalidArgument(msg),
            other => keel_core::Error::Unavailable(other.to_string()),
        }
    }
}

impl From<keel_core::Error> for DbError {
    fn from(err: keel_core::Error) -> Self {
        match err {
            keel_core::Error::NotFound(msg) => DbError::NotFound(msg),
            keel_core::Error::ConstraintViolation(msg) => DbError::Duplicate(msg),
            other => DbError::InvalidArgument(other.to_string()),
        }
    }
}
