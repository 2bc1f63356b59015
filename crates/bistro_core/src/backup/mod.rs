//! Backup and restore through an external dump tool.
//!
//! The [`BackupOrchestrator`] drives a [`DumpDialect`]'s command lines
//! through a [`ToolRunner`], suspending the [`PersistenceHandle`] around a
//! restore and reloading every cache afterwards.
//!
//! Restore phases, in order:
//!
//! ```text
//! Validating -> ConnectionChecking -> SessionClosing -> ConnectionDraining
//!   -> SchemaPreparing -> ExternalProcessRunning -> OutputVerifying
//!   -> SessionReopening -> CacheReloading -> Idle | Failed
//! ```
//!
//! Truncation happens in `SchemaPreparing` and is the point of no return.
//! `SessionReopening` and `CacheReloading` always run once the handle was
//! suspended, whatever happened in between.
//!
//! [`PersistenceHandle`]: crate::PersistenceHandle

mod dialect;
mod inspect;
mod naming;
mod orchestrator;
mod tool;

pub use dialect::{DumpDialect, PostgresDialect, SqliteDialect, POSTGRES_SCHEMA_SQL};
pub use inspect::{has_magic, DumpAnalysis};
pub use naming::{
    backup_file_name, delete_backup, list_backups, resolve_backup, sanitize_label,
    validate_file_name, BackupEntry, BackupFormat,
};
pub use orchestrator::BackupOrchestrator;
pub use tool::{Invocation, ProcessRunner, ToolOutput, ToolRunner};

use crate::cache::ReloadSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for backup and restore.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Directory dumps are written to and restored from.
    pub backup_dir: PathBuf,

    /// Dumps smaller than this many bytes are reported as a warning.
    pub min_size: u64,

    /// Deadline for dump, load and maintenance invocations.
    pub tool_timeout: Duration,

    /// Deadline for `--version` style probes.
    pub probe_timeout: Duration,

    /// Format used when the caller does not choose one.
    pub default_format: BackupFormat,

    /// Suspend the persistence handle while a backup runs.
    pub quiesce_for_backup: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("backups"),
            min_size: 100,
            tool_timeout: Duration::from_secs(600),
            probe_timeout: Duration::from_secs(30),
            default_format: BackupFormat::Custom,
            quiesce_for_backup: false,
        }
    }
}

impl BackupConfig {
    /// Default settings writing to `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Sets the minimum plausible dump size.
    #[must_use]
    pub const fn min_size(mut self, bytes: u64) -> Self {
        self.min_size = bytes;
        self
    }

    /// Sets the external tool deadline.
    #[must_use]
    pub const fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Sets the probe deadline.
    #[must_use]
    pub const fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the default dump format.
    #[must_use]
    pub const fn default_format(mut self, format: BackupFormat) -> Self {
        self.default_format = format;
        self
    }

    /// Suspends the handle during backups.
    #[must_use]
    pub const fn quiesce_for_backup(mut self, quiesce: bool) -> Self {
        self.quiesce_for_backup = quiesce;
        self
    }
}

/// Where a backup or restore currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPhase {
    /// Nothing running.
    Idle,
    /// Checking the label or file before touching anything.
    Validating,
    /// Probing the tool and the database.
    ConnectionChecking,
    /// Suspending the persistence handle.
    SessionClosing,
    /// Terminating other database sessions.
    ConnectionDraining,
    /// Creating tables and truncating them.
    SchemaPreparing,
    /// The dump or load tool is running.
    ExternalProcessRunning,
    /// Checking the tool's result.
    OutputVerifying,
    /// Resuming the persistence handle.
    SessionReopening,
    /// Reloading caches from the store.
    CacheReloading,
    /// The last operation failed.
    Failed,
}

impl BackupPhase {
    /// Returns true while an operation is in flight.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Failed)
    }
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::ConnectionChecking => "connection check",
            Self::SessionClosing => "session close",
            Self::ConnectionDraining => "connection drain",
            Self::SchemaPreparing => "schema preparation",
            Self::ExternalProcessRunning => "external process",
            Self::OutputVerifying => "output verification",
            Self::SessionReopening => "session reopen",
            Self::CacheReloading => "cache reload",
            Self::Failed => "failed",
        })
    }
}

/// Which operation a [`PhaseEvent`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Writing a dump.
    Backup,
    /// Loading a dump.
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        })
    }
}

/// A phase transition, published to orchestrator subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseEvent {
    /// Operation in progress.
    pub operation: Operation,
    /// Phase entered.
    pub phase: BackupPhase,
    /// Human-readable status.
    pub message: String,
    /// When the phase was entered.
    pub at: DateTime<Utc>,
}

/// How an operation that did not fail turned out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum BackupOutcome {
    /// Everything checked out.
    Success,
    /// Finished, but the result looks suspicious.
    Warning(String),
}

impl BackupOutcome {
    /// Returns true for [`BackupOutcome::Warning`].
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning(_))
    }
}

/// Result of a backup.
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    /// File name inside the backup directory.
    pub file_name: String,
    /// Full path of the dump.
    pub path: PathBuf,
    /// Dump format.
    pub format: BackupFormat,
    /// Size in bytes.
    pub size: u64,
    /// Success or warning.
    pub outcome: BackupOutcome,
    /// Captured tool output.
    pub output: Vec<String>,
    /// Wall time.
    pub duration: Duration,
}

/// Result of a restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    /// File that was restored.
    pub file_name: String,
    /// Dump format.
    pub format: BackupFormat,
    /// Success or warning.
    pub outcome: BackupOutcome,
    /// What the caches hold after the reload.
    pub loaded: ReloadSummary,
    /// Static analysis of a plain dump; `None` for custom archives.
    pub expected: Option<DumpAnalysis>,
    /// Captured output of the load tool.
    pub output: Vec<String>,
    /// Wall time.
    pub duration: Duration,
}

/// A request to restore a backup file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    /// File name inside the backup directory.
    pub file_name: String,
    /// The user explicitly confirmed the destructive restore.
    pub confirmed: bool,
}

impl RestoreRequest {
    /// An unconfirmed request for `file_name`.
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            confirmed: false,
        }
    }

    /// Marks the request as confirmed.
    #[must_use]
    pub fn confirm(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_activity() {
        assert!(!BackupPhase::Idle.is_active());
        assert!(!BackupPhase::Failed.is_active());
        assert!(BackupPhase::SchemaPreparing.is_active());
        assert_eq!(BackupPhase::CacheReloading.to_string(), "cache reload");
    }

    #[test]
    fn config_defaults() {
        let config = BackupConfig::new("/tmp/b").min_size(10);
        assert_eq!(config.min_size, 10);
        assert_eq!(config.tool_timeout, Duration::from_secs(600));
        assert_eq!(config.default_format, BackupFormat::Custom);
        assert_eq!(BackupConfig::default().min_size, 100);
    }

    #[test]
    fn restore_request_starts_unconfirmed() {
        let request = RestoreRequest::new("a.sql");
        assert!(!request.confirmed);
        assert!(request.confirm().confirmed);
    }
}
