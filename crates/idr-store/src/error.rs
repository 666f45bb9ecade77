use std::fmt;

use idr_core::InvariantViolation;
use rusqlite::ErrorCode;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    InvalidData(String),
    Invariant(InvariantViolation),
}

impl StoreError {
    /// Lock contention or a busy database; retrying the whole call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            StoreError::Invariant(v) => write!(f, "invariant violation: {v}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<InvariantViolation> for StoreError {
    fn from(v: InvariantViolation) -> Self {
        StoreError::Invariant(v)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
