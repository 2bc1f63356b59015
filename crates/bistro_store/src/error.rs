//! Error types for store operations.

use crate::backend::Table;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The SQLite engine reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    /// The backend cannot be reached or refused the connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness or referential-integrity constraint was violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// An update targeted a row that does not exist.
    #[error("no {table} row with id {id}")]
    RowNotFound {
        /// The table that was searched.
        table: Table,
        /// The missing row id.
        id: i64,
    },

    /// A value handed to the store has not been assigned an id yet.
    #[error("{table} row has no id")]
    MissingId {
        /// The table the row belongs to.
        table: Table,
    },

    /// A stored row failed domain validation.
    #[error("invalid row: {0}")]
    Invalid(#[from] ValidationError),

    /// A transaction primitive was used in the wrong state.
    #[error("transaction state error: {0}")]
    TransactionState(String),
}

impl StoreError {
    /// Returns true if the error means the connection itself is unusable.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Io(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Constraint(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => Self::Sqlite(err),
        }
    }
}

/// A domain value failed validation at construction time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field was empty after trimming.
    #[error("{field} must not be blank")]
    Blank {
        /// Name of the offending field.
        field: &'static str,
    },

    /// A review rating was outside 1..=5.
    #[error("rating must be between 1 and 5, got {0}")]
    RatingOutOfRange(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_failures_are_classified() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed: restaurants.name".into()),
        );
        let store_err = StoreError::from(err);
        assert!(matches!(store_err, StoreError::Constraint(ref m) if m.contains("UNIQUE")));
        assert!(!store_err.is_connection());
    }

    #[test]
    fn unavailable_is_connection_error() {
        assert!(StoreError::Unavailable("down".into()).is_connection());
        assert!(!StoreError::Constraint("dup".into()).is_connection());
    }

    #[test]
    fn row_not_found_message() {
        let err = StoreError::RowNotFound {
            table: Table::Reviews,
            id: 7,
        };
        assert_eq!(err.to_string(), "no reviews row with id 7");
    }
}
