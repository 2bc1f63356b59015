//! Test fixtures and context helpers.
//!
//! Provides convenience functions for building a fully wired
//! [`AppContext`] over an in-memory store, with backups going to a
//! temporary directory through the scripted dump tool.

use crate::scripted::{ScriptedDialect, ScriptedRunner};
use bistro_core::{AppContext, BackupConfig, Config};
use bistro_store::{MemoryBackend, Rating, Restaurant, SqliteBackend};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A test context with automatic cleanup.
pub struct TestContext {
    /// The application context.
    pub ctx: Arc<AppContext>,
    /// The store behind it.
    pub backend: MemoryBackend,
    /// The scripted dump tool.
    pub runner: Arc<ScriptedRunner>,
    /// Backup directory (kept alive to prevent cleanup).
    backup_dir: TempDir,
}

impl TestContext {
    /// Creates and opens a context with [`Config::fast`] over an empty store.
    pub fn new() -> Self {
        Self::with_config(Config::fast(), |b| b)
    }

    /// Creates and opens a context over an empty store.
    ///
    /// `backup` adjusts the backup settings; the directory is always a
    /// fresh temporary one.
    pub fn with_config(config: Config, backup: impl FnOnce(BackupConfig) -> BackupConfig) -> Self {
        Self::over(MemoryBackend::new(), config, backup)
    }

    /// Creates and opens a context over an existing backend.
    pub fn over(
        backend: MemoryBackend,
        config: Config,
        backup: impl FnOnce(BackupConfig) -> BackupConfig,
    ) -> Self {
        let backup_dir = TempDir::new().expect("Failed to create temp directory");
        let runner = Arc::new(ScriptedRunner::new(backend.clone()));
        let ctx = AppContext::builder(Arc::new(backend.clone()), Arc::new(ScriptedDialect::new()))
            .config(config)
            .backup_config(backup(BackupConfig::new(backup_dir.path())))
            .runner(runner.clone())
            .build()
            .expect("Failed to build context");
        ctx.open().expect("Failed to open context");
        Self {
            ctx,
            backend,
            runner,
            backup_dir,
        }
    }

    /// The backup directory.
    pub fn backup_dir(&self) -> &Path {
        self.backup_dir.path()
    }

    /// Adds a restaurant through the cache.
    pub fn add_restaurant(&self, name: &str, location: &str) -> Restaurant {
        self.ctx
            .restaurants()
            .add(Restaurant::new(name, location).expect("Invalid restaurant"))
            .expect("Failed to add restaurant")
    }

    /// Adds a review through the cache.
    pub fn add_review(&self, restaurant: &str, rating: i64, comment: &str) {
        self.ctx
            .reviews()
            .add(
                restaurant,
                Rating::new(rating).expect("Invalid rating"),
                comment,
            )
            .expect("Failed to add review");
    }

    /// Adds `count` restaurants named `Restaurant 0..count`, each with
    /// `reviews_each` reviews rated 1 to 5 in turn.
    pub fn seed(&self, count: usize, reviews_each: usize) {
        for i in 0..count {
            let name = format!("Restaurant {i}");
            self.add_restaurant(&name, &format!("Street {i}"));
            for j in 0..reviews_each {
                self.add_review(&name, (j % 5) as i64 + 1, &format!("review {j}"));
            }
        }
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestContext {
    type Target = AppContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

/// Runs a test with a fresh [`TestContext`].
///
/// # Example
///
/// ```rust,ignore
/// use bistro_testkit::with_test_context;
///
/// #[test]
/// fn my_test() {
///     with_test_context(|t| {
///         t.add_restaurant("Cafe X", "Downtown");
///         assert_eq!(t.restaurants().len(), 1);
///     });
/// }
/// ```
pub fn with_test_context<F, R>(f: F) -> R
where
    F: FnOnce(&TestContext) -> R,
{
    let t = TestContext::new();
    let result = f(&t);
    t.ctx.shutdown();
    result
}

/// A SQLite store in a temporary directory.
pub struct TestSqlite {
    /// The backend.
    pub backend: SqliteBackend,
    dir: TempDir,
}

impl TestSqlite {
    /// Creates an empty database file.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let backend = SqliteBackend::new(dir.path().join("bistro.db"));
        Self { backend, dir }
    }

    /// The directory holding the database.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TestSqlite {
    fn default() -> Self {
        Self::new()
    }
}
