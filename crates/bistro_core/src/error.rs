//! Error types for Bistro core.

use crate::backup::BackupPhase;
use crate::change_feed::EntityKind;
use bistro_store::{StoreError, ValidationError};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Bistro core operations.
///
/// Variants fall into two groups. Expected outcomes that the caller can
/// correct ([`NotFound`], [`DuplicateKey`], [`Validation`],
/// [`InvalidBackup`], [`InvalidSnapshot`]) and faults ([`Connection`], [`Sync`], tool failures,
/// I/O). See [`CoreError::is_user_correctable`].
///
/// [`NotFound`]: CoreError::NotFound
/// [`DuplicateKey`]: CoreError::DuplicateKey
/// [`Validation`]: CoreError::Validation
/// [`InvalidBackup`]: CoreError::InvalidBackup
/// [`InvalidSnapshot`]: CoreError::InvalidSnapshot
/// [`Connection`]: CoreError::Connection
/// [`Sync`]: CoreError::Sync
#[derive(Debug, Error)]
pub enum CoreError {
    /// The store is unreachable.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// An operation targeted a key that does not exist.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Entity type searched.
        entity: EntityKind,
        /// The missing key.
        key: String,
    },

    /// An add collided with an existing natural key.
    #[error("{entity} already exists: {key}")]
    DuplicateKey {
        /// Entity type.
        entity: EntityKind,
        /// The colliding key.
        key: String,
    },

    /// A value failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// An external executable could not be started.
    #[error("external tool not found: {program}")]
    ToolMissing {
        /// Program that was invoked.
        program: String,
    },

    /// An external executable exited unsuccessfully.
    #[error("{program} failed with exit code {}{}", exit_code(.code), last_line(.output))]
    ToolFailed {
        /// Program that was invoked.
        program: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Captured combined output.
        output: Vec<String>,
    },

    /// An external executable ran past its deadline and was killed.
    #[error("{program} did not finish within {timeout:?}")]
    ToolTimeout {
        /// Program that was invoked.
        program: String,
        /// The deadline that expired.
        timeout: Duration,
    },

    /// A backup file failed its sanity checks.
    #[error("invalid backup '{file}': {reason}")]
    InvalidBackup {
        /// File name as given by the caller.
        file: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A snapshot file could not be parsed or is inconsistent.
    #[error("invalid snapshot '{file}': {reason}")]
    InvalidSnapshot {
        /// Path as given by the caller.
        file: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A cache reload exhausted its retries.
    #[error("{entity} cache sync failed after {attempts} attempts: {message}")]
    Sync {
        /// Cache that failed.
        entity: EntityKind,
        /// Attempts made.
        attempts: u32,
        /// Last underlying error.
        message: String,
    },

    /// A backup or restore step failed.
    #[error("{phase} failed: {source}")]
    Backup {
        /// Phase in which the failure happened.
        phase: BackupPhase,
        /// Underlying failure.
        source: Box<CoreError>,
    },

    /// The operation was cancelled before it started changing state.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// A background task panicked or was dropped before completing.
    #[error("task '{task}' failed: {message}")]
    TaskFailed {
        /// Name of the task.
        task: String,
        /// Panic payload or reason.
        message: String,
    },

    /// Store error that is not a connection problem.
    #[error("store error: {0}")]
    Store(#[source] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

fn last_line(output: &[String]) -> String {
    output
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| format!(": {}", l.trim()))
        .unwrap_or_default()
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        if err.is_connection() {
            return Self::Connection {
                message: err.to_string(),
            };
        }
        match err {
            StoreError::Invalid(v) => Self::Validation(v),
            other => Self::Store(other),
        }
    }
}

impl CoreError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(entity: EntityKind, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Creates a duplicate-key error.
    pub fn duplicate(entity: EntityKind, key: impl ToString) -> Self {
        Self::DuplicateKey {
            entity,
            key: key.to_string(),
        }
    }

    /// Creates an invalid backup error.
    pub fn invalid_backup(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidBackup {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid snapshot error.
    pub fn invalid_snapshot(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a task failure error.
    pub fn task_failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailed {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Wraps an error with the backup phase it occurred in.
    ///
    /// Already-wrapped errors keep their original phase.
    pub fn in_phase(self, phase: BackupPhase) -> Self {
        match self {
            Self::Backup { .. } => self,
            other => Self::Backup {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The backup phase a failure belongs to, if any.
    pub fn phase(&self) -> Option<BackupPhase> {
        match self {
            Self::Backup { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// The innermost error, unwrapping phase context.
    pub fn root(&self) -> &CoreError {
        match self {
            Self::Backup { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true for outcomes the user can fix by changing the input.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self.root(),
            Self::NotFound { .. }
                | Self::DuplicateKey { .. }
                | Self::Validation(_)
                | Self::InvalidBackup { .. }
                | Self::InvalidSnapshot { .. }
        )
    }

    /// Returns true for faults worth a bounded local retry.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Connection { .. } | Self::Sync { .. } => true,
            Self::Store(e) => e.is_connection(),
            _ => false,
        }
    }

    /// Captured external tool output attached to this error, if any.
    pub fn tool_output(&self) -> &[String] {
        match self.root() {
            Self::ToolFailed { output, .. } => output,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_connection_errors_become_connection() {
        let err: CoreError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(err, CoreError::Connection { .. }));
        assert!(err.is_retryable());
        assert!(!err.is_user_correctable());
    }

    #[test]
    fn store_validation_errors_become_validation() {
        let err: CoreError = StoreError::Invalid(ValidationError::RatingOutOfRange(9)).into();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(err.is_user_correctable());
    }

    #[test]
    fn phase_wrapping_is_idempotent() {
        let err = CoreError::not_found(EntityKind::Restaurant, "Cafe X")
            .in_phase(BackupPhase::Validating)
            .in_phase(BackupPhase::CacheReloading);
        assert_eq!(err.phase(), Some(BackupPhase::Validating));
        assert!(err.is_user_correctable());
        assert_eq!(
            err.to_string(),
            "validating failed: restaurant not found: Cafe X"
        );
    }

    #[test]
    fn tool_failed_message_includes_last_line() {
        let err = CoreError::ToolFailed {
            program: "pg_dump".into(),
            code: Some(1),
            output: vec!["connecting".into(), "fatal: no such database".into(), "".into()],
        };
        assert_eq!(
            err.to_string(),
            "pg_dump failed with exit code 1: fatal: no such database"
        );
        assert_eq!(err.tool_output().len(), 3);
    }
}
