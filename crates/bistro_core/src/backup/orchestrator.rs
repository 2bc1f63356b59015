//! The backup/restore state machine.

use super::dialect::DumpDialect;
use super::inspect::{has_magic, DumpAnalysis};
use super::naming::{self, BackupEntry, BackupFormat};
use super::tool::{Invocation, ToolOutput, ToolRunner};
use super::{
    BackupConfig, BackupOutcome, BackupPhase, BackupReport, Operation, PhaseEvent,
    RestoreReport, RestoreRequest,
};
use crate::cache::{CacheSet, ReloadSummary};
use crate::concurrency::{Executors, TaskHandle};
use crate::error::{CoreError, CoreResult};
use crate::handle::PersistenceHandle;
use chrono::{Local, Utc};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs backups and restores one at a time.
///
/// # Example
///
/// ```rust,ignore
/// let report = ctx.backup().create_backup("nightly", None)?;
/// println!("wrote {} ({} bytes)", report.file_name, report.size);
///
/// let report = ctx.backup().restore(RestoreRequest::new(report.file_name).confirm())?;
/// assert_eq!(report.loaded.restaurants, ctx.restaurants().len());
/// ```
pub struct BackupOrchestrator {
    config: BackupConfig,
    dialect: Arc<dyn DumpDialect>,
    runner: Arc<dyn ToolRunner>,
    handle: Arc<PersistenceHandle>,
    executors: Arc<Executors>,
    caches: CacheSet,
    phase: Mutex<BackupPhase>,
    busy: Mutex<()>,
    cancelled: AtomicBool,
    subscribers: Mutex<Vec<Sender<PhaseEvent>>>,
}

/// Output of the load and repair steps.
struct Loaded {
    output: Vec<String>,
    warnings: Vec<String>,
}

/// Lines a tool printed that look like trouble despite a zero exit code.
fn suspicious_lines(output: &ToolOutput) -> Vec<String> {
    output
        .lines
        .iter()
        .filter(|l| {
            let lower = l.to_ascii_lowercase();
            lower.contains("error") || lower.contains("warning")
        })
        .cloned()
        .collect()
}

impl BackupOrchestrator {
    /// Creates an idle orchestrator.
    pub fn new(
        config: BackupConfig,
        dialect: Arc<dyn DumpDialect>,
        runner: Arc<dyn ToolRunner>,
        handle: Arc<PersistenceHandle>,
        executors: Arc<Executors>,
        caches: CacheSet,
    ) -> Self {
        Self {
            config,
            dialect,
            runner,
            handle,
            executors,
            caches,
            phase: Mutex::new(BackupPhase::Idle),
            busy: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> BackupPhase {
        *self.phase.lock()
    }

    /// Returns true while a backup or restore is running.
    pub fn is_busy(&self) -> bool {
        self.busy.is_locked()
    }

    /// Settings in use.
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Subscribes to phase transitions.
    pub fn subscribe(&self) -> Receiver<PhaseEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Asks the running operation to stop.
    ///
    /// Honoured only up to the truncate step of a restore; a backup is
    /// checked before its dump starts. Has no effect when idle.
    pub fn cancel(&self) {
        if self.is_busy() {
            tracing::info!(phase = %self.phase(), "cancellation requested");
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn enter(&self, operation: Operation, phase: BackupPhase, message: impl Into<String>) {
        let message = message.into();
        *self.phase.lock() = phase;
        tracing::info!(%operation, %phase, "{message}");
        let event = PhaseEvent {
            operation,
            phase,
            message,
            at: Utc::now(),
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn check_cancelled(&self) -> CoreResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn begin(&self) -> CoreResult<parking_lot::MutexGuard<'_, ()>> {
        let guard = self
            .busy
            .try_lock()
            .ok_or_else(|| CoreError::invalid_operation("a backup or restore is already running"))?;
        self.cancelled.store(false, Ordering::SeqCst);
        Ok(guard)
    }

    fn finish<T>(&self, operation: Operation, result: CoreResult<T>) -> CoreResult<T> {
        match &result {
            Ok(_) => self.enter(operation, BackupPhase::Idle, format!("{operation} finished")),
            Err(e) => {
                tracing::error!(%operation, phase = ?e.phase(), error = %e, "{operation} failed");
                self.enter(operation, BackupPhase::Failed, e.to_string());
            }
        }
        result
    }

    fn run(&self, invocation: &Invocation, timeout: Duration) -> CoreResult<ToolOutput> {
        self.runner.run(invocation, timeout)
    }

    /// Runs a `--version` style probe. Any failure means the tool is unusable.
    fn probe(&self, invocation: &Invocation) -> CoreResult<()> {
        let output = self.run(invocation, self.config.probe_timeout)?;
        if output.success() {
            Ok(())
        } else {
            Err(CoreError::ToolMissing {
                program: invocation.program.clone(),
            })
        }
    }

    fn run_checked(&self, invocation: &Invocation) -> CoreResult<ToolOutput> {
        self.run(invocation, self.config.tool_timeout)?
            .check(&invocation.program)
    }

    /// Writes a dump of the live store.
    ///
    /// `label` is sanitized and suffixed with a timestamp. A dump smaller
    /// than [`BackupConfig::min_size`] yields [`BackupOutcome::Warning`].
    pub fn create_backup(
        &self,
        label: &str,
        format: Option<BackupFormat>,
    ) -> CoreResult<BackupReport> {
        let _busy = self.begin()?;
        let started = Instant::now();
        let result = self.run_backup(label, format.unwrap_or(self.config.default_format), started);
        self.finish(Operation::Backup, result)
    }

    /// Runs [`create_backup`](Self::create_backup) on the I/O pool.
    pub fn create_backup_async(
        self: &Arc<Self>,
        label: impl Into<String>,
        format: Option<BackupFormat>,
    ) -> CoreResult<TaskHandle<BackupReport>> {
        let this = Arc::clone(self);
        let label = label.into();
        self.executors
            .io()
            .spawn("backup", move || this.create_backup(&label, format))
    }

    fn run_backup(
        &self,
        label: &str,
        format: BackupFormat,
        started: Instant,
    ) -> CoreResult<BackupReport> {
        use BackupPhase::*;
        let op = Operation::Backup;

        self.enter(op, Validating, format!("preparing {format} backup"));
        let path = (|| -> CoreResult<_> {
            let label = naming::sanitize_label(label)?;
            fs::create_dir_all(&self.config.backup_dir)?;
            Ok(naming::unique_path(&self.config.backup_dir, &label, format, Local::now()))
        })()
        .map_err(|e| e.in_phase(Validating))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.enter(op, ConnectionChecking, format!("checking {} tools", self.dialect.name()));
        self.probe(&self.dialect.dump_probe())
            .and_then(|()| self.run_checked(&self.dialect.check_connection()).map(drop))
            .and_then(|()| self.check_cancelled())
            .map_err(|e| e.in_phase(ConnectionChecking))?;

        if self.config.quiesce_for_backup {
            self.enter(op, SessionClosing, "suspending persistence handle");
            self.handle.suspend();
        }

        self.enter(op, ExternalProcessRunning, format!("writing {file_name}"));
        let dumped = self.run_checked(&self.dialect.dump(format, &path));

        if self.config.quiesce_for_backup {
            self.enter(op, SessionReopening, "resuming persistence handle");
            if let Err(e) = self.handle.resume() {
                tracing::warn!(error = %e, "handle did not reopen after backup");
                self.executors
                    .errors()
                    .report("backup reopen", e.to_string());
            }
        }

        let output = match dumped {
            Ok(output) => output,
            Err(e) => {
                self.remove_partial(&path);
                return Err(e.in_phase(ExternalProcessRunning));
            }
        };

        self.enter(op, OutputVerifying, format!("verifying {file_name}"));
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::invalid_backup(
                    &file_name,
                    "dump tool exited successfully but wrote no file",
                )
                .in_phase(OutputVerifying))
            }
            Err(e) => return Err(CoreError::from(e).in_phase(OutputVerifying)),
        };
        let outcome = if size < self.config.min_size {
            tracing::warn!(file = %file_name, size, "backup file is implausibly small");
            BackupOutcome::Warning(format!(
                "backup file is only {size} bytes; the dump may be empty"
            ))
        } else {
            BackupOutcome::Success
        };

        tracing::info!(file = %file_name, size, "backup written");
        Ok(BackupReport {
            file_name,
            path,
            format,
            size,
            outcome,
            output: output.lines,
            duration: started.elapsed(),
        })
    }

    fn remove_partial(&self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => tracing::info!(path = %path.display(), "removed incomplete dump"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "could not remove incomplete dump"
            ),
        }
    }

    /// Replaces the store's contents with a backup and reloads the caches.
    ///
    /// The request must be confirmed. The file is validated before the
    /// handle is touched; once the handle is suspended it is always resumed
    /// and the caches are always reloaded, even if the load failed.
    pub fn restore(&self, request: RestoreRequest) -> CoreResult<RestoreReport> {
        if !request.confirmed {
            return Err(CoreError::invalid_operation(
                "restore replaces all data and must be confirmed",
            ));
        }
        let _busy = self.begin()?;
        let started = Instant::now();
        let result = self.run_restore(&request.file_name, started);
        self.finish(Operation::Restore, result)
    }

    /// Runs [`restore`](Self::restore) on the I/O pool.
    pub fn restore_async(
        self: &Arc<Self>,
        request: RestoreRequest,
    ) -> CoreResult<TaskHandle<RestoreReport>> {
        let this = Arc::clone(self);
        self.executors
            .io()
            .spawn("restore", move || this.restore(request))
    }

    /// Checks the file and returns its format and, for plain dumps, its
    /// analysis.
    fn validate(
        &self,
        name: &str,
    ) -> CoreResult<(std::path::PathBuf, BackupFormat, Option<DumpAnalysis>)> {
        let (path, format) = naming::resolve_backup(&self.config.backup_dir, name)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::invalid_backup(name, "no such backup file"))
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err(CoreError::invalid_backup(name, "not a regular file"));
        }
        if meta.len() == 0 {
            return Err(CoreError::invalid_backup(name, "file is empty"));
        }

        let analysis = match format {
            BackupFormat::Custom => {
                if !has_magic(&path, self.dialect.custom_magic())? {
                    return Err(CoreError::invalid_backup(
                        name,
                        format!("not a {} custom-format dump", self.dialect.name()),
                    ));
                }
                None
            }
            BackupFormat::Plain => {
                let analysis = DumpAnalysis::from_file(&path)?;
                tracing::debug!(file = %name, ?analysis, "plain dump analysed");
                analysis.ensure_restorable(name)?;
                Some(analysis)
            }
        };
        Ok((path, format, analysis))
    }

    fn run_restore(&self, name: &str, started: Instant) -> CoreResult<RestoreReport> {
        use BackupPhase::*;
        let op = Operation::Restore;

        self.enter(op, Validating, format!("validating {name}"));
        let (path, format, expected) = self
            .validate(name)
            .and_then(|v| self.check_cancelled().map(|()| v))
            .map_err(|e| e.in_phase(Validating))?;

        self.enter(op, ConnectionChecking, format!("checking {} tools", self.dialect.name()));
        self.probe(&self.dialect.load_probe(format))
            .and_then(|()| self.run_checked(&self.dialect.check_connection()).map(drop))
            .and_then(|()| self.check_cancelled())
            .map_err(|e| e.in_phase(ConnectionChecking))?;

        self.enter(op, SessionClosing, "suspending persistence handle");
        self.handle.suspend();

        let loaded = self.load(&path, format);
        let verify = expected.as_ref().filter(|_| loaded.is_ok());
        let reloaded = self.reopen_and_reload(name, verify);

        let (loaded, (summary, mut warnings)) = match (loaded, reloaded) {
            (Ok(loaded), Ok(reloaded)) => (loaded, reloaded),
            (Err(e), Ok(_)) | (Ok(_), Err(e)) => return Err(e),
            (Err(e), Err(recovery)) => {
                tracing::error!(error = %recovery, "recovery after failed restore also failed");
                self.executors
                    .errors()
                    .report("restore recovery", recovery.to_string());
                return Err(e);
            }
        };
        warnings.extend(loaded.warnings);

        let outcome = if warnings.is_empty() {
            BackupOutcome::Success
        } else {
            BackupOutcome::Warning(warnings.join("; "))
        };
        tracing::info!(
            file = %name,
            restaurants = summary.restaurants,
            reviews = summary.reviews,
            "restore complete"
        );
        Ok(RestoreReport {
            file_name: name.to_string(),
            format,
            outcome,
            loaded: summary,
            expected,
            output: loaded.output,
            duration: started.elapsed(),
        })
    }

    /// Drain, truncate, load and repair. Runs with the handle suspended.
    fn load(&self, path: &Path, format: BackupFormat) -> CoreResult<Loaded> {
        use BackupPhase::*;
        let op = Operation::Restore;

        self.enter(op, ConnectionDraining, "terminating other database sessions");
        if let Some(terminate) = self.dialect.terminate_connections() {
            let drained = self.run_checked(&terminate);
            if let Err(e) = drained {
                tracing::warn!(error = %e, "could not terminate other sessions, continuing");
                self.executors
                    .errors()
                    .report("restore drain", e.to_string());
            }
        }
        self.check_cancelled().map_err(|e| e.in_phase(ConnectionDraining))?;

        self.enter(op, SchemaPreparing, "emptying tables");
        (|| -> CoreResult<()> {
            if format == BackupFormat::Plain {
                self.run_checked(&self.dialect.prepare_schema())?;
            }
            self.run_checked(&self.dialect.truncate())?;
            Ok(())
        })()
        .map_err(|e| e.in_phase(SchemaPreparing))?;
        tracing::warn!("tables truncated, restore can no longer be cancelled");

        self.enter(op, ExternalProcessRunning, format!("loading {}", path.display()));
        let output = self
            .run_checked(&self.dialect.load(format, path))
            .map_err(|e| e.in_phase(ExternalProcessRunning))?;

        self.enter(op, OutputVerifying, "repairing id sequences");
        let repaired = self
            .run_checked(&self.dialect.repair_sequences())
            .map_err(|e| e.in_phase(OutputVerifying))?;

        let mut warnings = suspicious_lines(&output);
        warnings.extend(suspicious_lines(&repaired));
        if !warnings.is_empty() {
            warnings = vec![format!(
                "load tool reported {} warning line(s): {}",
                warnings.len(),
                warnings[0]
            )];
        }
        Ok(Loaded {
            output: output.lines,
            warnings,
        })
    }

    /// Resumes the handle and reloads every cache, then compares counts
    /// with what the dump contained.
    fn reopen_and_reload(
        &self,
        name: &str,
        expected: Option<&DumpAnalysis>,
    ) -> CoreResult<(ReloadSummary, Vec<String>)> {
        use BackupPhase::*;
        let op = Operation::Restore;

        self.enter(op, SessionReopening, "resuming persistence handle");
        let reopened = self.handle.resume().map_err(|e| e.in_phase(SessionReopening));
        if let Err(e) = &reopened {
            tracing::warn!(error = %e, "handle did not reopen, cache reload will retry");
        }

        self.enter(op, CacheReloading, "reloading caches");
        let summary = self
            .caches
            .reload_all()
            .map_err(|e| e.in_phase(CacheReloading))?;
        reopened?;

        let mut warnings = Vec::new();
        match expected {
            Some(analysis) => {
                if analysis.restaurant_rows > 0 && summary.restaurants == 0 {
                    return Err(CoreError::invalid_backup(
                        name,
                        format!(
                            "dump holds {} restaurant rows but none were restored",
                            analysis.restaurant_rows
                        ),
                    )
                    .in_phase(CacheReloading));
                }
                if analysis.restaurant_rows != summary.restaurants {
                    warnings.push(format!(
                        "dump holds {} restaurant rows, {} restored",
                        analysis.restaurant_rows, summary.restaurants
                    ));
                }
                if analysis.review_rows != summary.reviews {
                    warnings.push(format!(
                        "dump holds {} review rows, {} restored",
                        analysis.review_rows, summary.reviews
                    ));
                }
            }
            None if summary.restaurants == 0 => {
                warnings.push("restore finished but no restaurants were loaded".to_string());
            }
            None => {}
        }
        Ok((summary, warnings))
    }

    /// Backups in the configured directory, newest first.
    pub fn list_backups(&self) -> CoreResult<Vec<BackupEntry>> {
        naming::list_backups(&self.config.backup_dir)
    }

    /// Deletes a backup file. Refused while an operation is running.
    pub fn delete_backup(&self, name: &str) -> CoreResult<()> {
        let _busy = self.begin()?;
        naming::delete_backup(&self.config.backup_dir, name)
    }
}

impl std::fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupOrchestrator")
            .field("dialect", &self.dialect.name())
            .field("backup_dir", &self.config.backup_dir)
            .field("phase", &self.phase())
            .finish()
    }
}
