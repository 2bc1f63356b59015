//! Backup file naming, validation and directory listing.

use crate::error::{CoreError, CoreResult};
use bistro_store::ValidationError;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// On-disk format of a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    /// The dump tool's own archive format.
    Custom,
    /// Plain SQL statements.
    Plain,
}

impl BackupFormat {
    /// File extension written for this format.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Custom => "backup",
            Self::Plain => "sql",
        }
    }

    /// Infers the format from a file extension.
    ///
    /// `.backup` and `.dump` are custom archives, `.sql` is plain.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "backup" | "dump" => Some(Self::Custom),
            "sql" => Some(Self::Plain),
            _ => None,
        }
    }
}

impl fmt::Display for BackupFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Custom => "custom",
            Self::Plain => "plain",
        })
    }
}

impl std::str::FromStr for BackupFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "custom" | "c" => Ok(Self::Custom),
            "plain" | "p" | "sql" => Ok(Self::Plain),
            other => Err(format!("unknown backup format '{other}'")),
        }
    }
}

fn allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// Replaces every character outside `[A-Za-z0-9_.-]` with `_`.
///
/// The label is trimmed first; a blank label is rejected. Runs of dots
/// are broken up so the resulting file name passes
/// [`validate_file_name`] later.
pub fn sanitize_label(label: &str) -> Result<String, ValidationError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(ValidationError::Blank {
            field: "backup label",
        });
    }
    let mut clean: String = label
        .chars()
        .map(|c| if allowed(c) { c } else { '_' })
        .collect();
    while clean.contains("..") {
        clean = clean.replace("..", "_.");
    }
    Ok(clean)
}

/// `<label>_<yyyy-MM-dd_HH-mm>.<ext>` for an already sanitized label.
pub fn backup_file_name(label: &str, format: BackupFormat, at: DateTime<Local>) -> String {
    format!(
        "{label}_{}.{}",
        at.format("%Y-%m-%d_%H-%M"),
        format.extension()
    )
}

/// Picks a path in `dir` that does not exist yet.
///
/// Appends `_1`, `_2`, ... before the extension when the plain name is
/// taken.
pub(crate) fn unique_path(
    dir: &Path,
    label: &str,
    format: BackupFormat,
    at: DateTime<Local>,
) -> PathBuf {
    let path = dir.join(backup_file_name(label, format, at));
    if !path.exists() {
        return path;
    }
    let stem = format!("{label}_{}", at.format("%Y-%m-%d_%H-%M"));
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{counter}.{}", format.extension()));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Checks a caller-supplied backup file name.
///
/// Rejects traversal sequences, path separators and any character
/// outside `[A-Za-z0-9_.-]`, and requires a known dump extension.
pub fn validate_file_name(name: &str) -> CoreResult<BackupFormat> {
    if name.is_empty() {
        return Err(CoreError::invalid_backup(name, "file name is empty"));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(CoreError::invalid_backup(
            name,
            "file name must not contain path components",
        ));
    }
    if let Some(bad) = name.chars().find(|c| !allowed(*c)) {
        return Err(CoreError::invalid_backup(
            name,
            format!("file name contains disallowed character {bad:?}"),
        ));
    }
    BackupFormat::from_path(Path::new(name)).ok_or_else(|| {
        CoreError::invalid_backup(name, "expected a .backup, .dump or .sql file")
    })
}

/// Resolves a validated file name inside `dir`.
pub fn resolve_backup(dir: &Path, name: &str) -> CoreResult<(PathBuf, BackupFormat)> {
    let format = validate_file_name(name)?;
    Ok((dir.join(name), format))
}

/// A dump file found in the backup directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupEntry {
    /// File name without directory.
    pub name: String,
    /// Full path.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Format inferred from the extension.
    pub format: BackupFormat,
}

/// Lists dump files in `dir`, newest first.
///
/// A missing directory is an empty list.
pub fn list_backups(dir: &Path) -> CoreResult<Vec<BackupEntry>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(format) = BackupFormat::from_path(&path) else {
            continue;
        };
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        backups.push(BackupEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            size: meta.len(),
            modified: meta.modified().map(DateTime::<Utc>::from)?,
            format,
        });
    }
    backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(backups)
}

/// Deletes the backup called `name` from `dir`.
pub fn delete_backup(dir: &Path, name: &str) -> CoreResult<()> {
    let (path, _) = resolve_backup(dir, name)?;
    match fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!(file = %name, "backup deleted");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(CoreError::invalid_backup(name, "no such backup file"))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn label_disallowed_characters_become_underscores() {
        assert_eq!(sanitize_label(" nightly run ").unwrap(), "nightly_run");
        assert_eq!(sanitize_label("../etc/passwd").unwrap(), "_._etc_passwd");
        assert_eq!(sanitize_label("v1.2-final").unwrap(), "v1.2-final");
        assert!(sanitize_label("   ").is_err());
    }

    #[test]
    fn file_name_has_timestamp_and_extension() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(
            backup_file_name("weekly", BackupFormat::Custom, at),
            "weekly_2024-03-09_14-05.backup"
        );
        assert_eq!(
            backup_file_name("weekly", BackupFormat::Plain, at),
            "weekly_2024-03-09_14-05.sql"
        );
    }

    #[test]
    fn unique_path_adds_counter() {
        let dir = tempfile::tempdir().unwrap();
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        let first = unique_path(dir.path(), "x", BackupFormat::Custom, at);
        fs::write(&first, b"taken").unwrap();
        let second = unique_path(dir.path(), "x", BackupFormat::Custom, at);
        assert_eq!(
            second.file_name().unwrap().to_str().unwrap(),
            "x_2024-03-09_14-05_1.backup"
        );
    }

    #[test]
    fn traversal_is_rejected() {
        for name in ["../secret.sql", "a/b.sql", "a\\b.sql", "..", "x y.sql", ""] {
            let err = validate_file_name(name).unwrap_err();
            assert!(matches!(err, CoreError::InvalidBackup { .. }), "{name}");
        }
        assert!(validate_file_name("notes.txt").is_err());
        assert_eq!(validate_file_name("a_1.dump").unwrap(), BackupFormat::Custom);
        assert_eq!(validate_file_name("a_1.sql").unwrap(), BackupFormat::Plain);
    }

    #[test]
    fn listing_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.sql"), b"insert").unwrap();
        fs::write(dir.path().join("ignored.txt"), b"x").unwrap();
        let old = fs::File::options()
            .write(true)
            .open(dir.path().join("old.sql"))
            .unwrap();
        old.set_modified(std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000))
            .unwrap();
        fs::write(dir.path().join("new.backup"), b"data").unwrap();

        let listed = list_backups(dir.path()).unwrap();
        let names: Vec<_> = listed.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["new.backup", "old.sql"]);
        assert_eq!(listed[1].format, BackupFormat::Plain);

        assert!(list_backups(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn delete_removes_only_valid_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.sql"), b"x").unwrap();
        delete_backup(dir.path(), "a.sql").unwrap();
        assert!(!dir.path().join("a.sql").exists());
        assert!(delete_backup(dir.path(), "a.sql").is_err());
        assert!(delete_backup(dir.path(), "../a.sql").is_err());
    }

    proptest! {
        #[test]
        fn sanitized_labels_only_contain_allowed_chars(label in "\\PC{1,40}") {
            if let Ok(clean) = sanitize_label(&label) {
                prop_assert!(clean.chars().all(allowed));
                prop_assert!(!clean.contains(".."));
            }
        }
    }
}
