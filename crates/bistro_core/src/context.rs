//! The application root that owns every long-lived component.

use crate::backup::{BackupConfig, BackupOrchestrator, DumpDialect, ProcessRunner, ToolRunner};
use crate::cache::{CacheDeps, CacheSet, ReloadSummary, RestaurantCache, ReviewCache};
use crate::change_feed::ChangeFeed;
use crate::concurrency::{ErrorSink, Executors, ScheduledHandle};
use crate::config::Config;
use crate::consistency::RatingSync;
use crate::error::{CoreError, CoreResult};
use crate::handle::PersistenceHandle;
use crate::snapshot::{ExportReport, ImportReport};
use crate::stats::Statistics;
use bistro_store::StoreBackend;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Builder for [`AppContext`].
pub struct AppContextBuilder {
    backend: Arc<dyn StoreBackend>,
    dialect: Arc<dyn DumpDialect>,
    config: Config,
    backup_config: BackupConfig,
    runner: Option<Arc<dyn ToolRunner>>,
}

impl AppContextBuilder {
    /// Sets the runtime configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the backup configuration.
    #[must_use]
    pub fn backup_config(mut self, config: BackupConfig) -> Self {
        self.backup_config = config;
        self
    }

    /// Replaces the process runner used for external tools.
    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Starts the pools and wires the components. Nothing is opened yet.
    pub fn build(self) -> CoreResult<Arc<AppContext>> {
        let config = Arc::new(self.config);
        let executors = Arc::new(Executors::new(&config)?);
        let handle = Arc::new(PersistenceHandle::new(self.backend, &config));
        let feed = Arc::new(ChangeFeed::with_max_history(config.change_history));
        let caches = CacheSet::new(CacheDeps {
            handle: Arc::clone(&handle),
            executors: Arc::clone(&executors),
            feed: Arc::clone(&feed),
            config: Arc::clone(&config),
        });
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(ProcessRunner::new()));
        let backup = Arc::new(BackupOrchestrator::new(
            self.backup_config,
            self.dialect,
            runner,
            Arc::clone(&handle),
            Arc::clone(&executors),
            caches.clone(),
        ));

        Ok(Arc::new(AppContext {
            config,
            executors,
            handle,
            feed,
            caches,
            backup,
            refresh: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }))
    }
}

/// Owns the pools, the persistence handle, the caches and the backup
/// orchestrator.
///
/// There is one context per application, constructed at the root and
/// shared by `Arc`. Components receive their collaborators from here
/// instead of reaching for globals.
pub struct AppContext {
    config: Arc<Config>,
    executors: Arc<Executors>,
    handle: Arc<PersistenceHandle>,
    feed: Arc<ChangeFeed>,
    caches: CacheSet,
    backup: Arc<BackupOrchestrator>,
    refresh: Mutex<Option<ScheduledHandle>>,
    shut_down: AtomicBool,
}

impl AppContext {
    /// Starts a builder over a store backend and its dump dialect.
    pub fn builder(
        backend: Arc<dyn StoreBackend>,
        dialect: Arc<dyn DumpDialect>,
    ) -> AppContextBuilder {
        AppContextBuilder {
            backend,
            dialect,
            config: Config::default(),
            backup_config: BackupConfig::default(),
            runner: None,
        }
    }

    /// Opens the store, loads both caches and starts the periodic refresh
    /// if one is configured.
    pub fn open(&self) -> CoreResult<ReloadSummary> {
        self.handle.open()?;
        let summary = self.caches.reload_all()?;
        tracing::info!(
            restaurants = summary.restaurants,
            reviews = summary.reviews,
            ratings_fixed = summary.ratings_fixed,
            "context opened"
        );

        if let Some(interval) = self.config.refresh_interval {
            let mut refresh = self.refresh.lock();
            if refresh.is_none() {
                let caches = self.caches.clone();
                let backup = Arc::clone(&self.backup);
                *refresh = Some(self.executors.scheduler().schedule_at_fixed_rate(
                    "cache refresh",
                    interval,
                    interval,
                    move || {
                        if backup.is_busy() {
                            tracing::debug!("skipping cache refresh during backup or restore");
                            return;
                        }
                        if let Err(e) = caches.reload_all() {
                            tracing::warn!(error = %e, "periodic cache refresh failed");
                        }
                    },
                )?);
            }
        }
        Ok(summary)
    }

    /// Stops the refresh, closes the handle and shuts the pools down.
    ///
    /// Idempotent. Returns false if some pool did not stop in time.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        if let Some(refresh) = self.refresh.lock().take() {
            refresh.cancel();
        }
        self.handle.close();
        let clean = self.executors.shutdown(self.config.shutdown_timeout);
        tracing::info!(clean, "context shut down");
        clean
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The restaurant cache.
    pub fn restaurants(&self) -> &Arc<RestaurantCache> {
        &self.caches.restaurants
    }

    /// The review cache.
    pub fn reviews(&self) -> &Arc<ReviewCache> {
        &self.caches.reviews
    }

    /// Rating recomputation.
    pub fn ratings(&self) -> &Arc<RatingSync> {
        &self.caches.ratings
    }

    /// Both caches.
    pub fn caches(&self) -> &CacheSet {
        &self.caches
    }

    /// Change notifications.
    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    /// The persistence handle.
    pub fn handle(&self) -> &Arc<PersistenceHandle> {
        &self.handle
    }

    /// Worker pools.
    pub fn executors(&self) -> &Arc<Executors> {
        &self.executors
    }

    /// Backup and restore.
    pub fn backup(&self) -> &Arc<BackupOrchestrator> {
        &self.backup
    }

    /// Failures from background work.
    pub fn errors(&self) -> &Arc<ErrorSink> {
        self.executors.errors()
    }

    /// Writes both caches to a JSON snapshot file.
    pub fn export_snapshot(&self, path: impl AsRef<Path>) -> CoreResult<ExportReport> {
        self.caches.export_snapshot(path.as_ref())
    }

    /// Replaces all data with a JSON snapshot file.
    ///
    /// Refused while a backup or restore is running.
    pub fn import_snapshot(&self, path: impl AsRef<Path>) -> CoreResult<ImportReport> {
        if self.backup.is_busy() {
            return Err(CoreError::invalid_operation(
                "cannot import while a backup or restore is running",
            ));
        }
        self.caches.import_snapshot(path.as_ref())
    }

    /// Counts and rating figures over the cached data.
    pub fn statistics(&self) -> Statistics {
        Statistics::collect(&self.caches)
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("handle", &self.handle)
            .field("restaurants", &self.caches.restaurants)
            .field("reviews", &self.caches.reviews)
            .field("backup", &self.backup)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::SqliteDialect;
    use crate::HandleState;
    use bistro_store::{MemoryBackend, Rating, Restaurant};
    use std::time::Duration;

    fn context(backend: &MemoryBackend) -> Arc<AppContext> {
        AppContext::builder(
            Arc::new(backend.clone()),
            Arc::new(SqliteDialect::new("unused.db")),
        )
        .config(Config::fast())
        .build()
        .unwrap()
    }

    #[test]
    fn open_loads_existing_rows() {
        let backend = MemoryBackend::new();
        let ctx = context(&backend);
        ctx.open().unwrap();
        ctx.restaurants()
            .add(Restaurant::new("Cafe X", "Downtown").unwrap())
            .unwrap();
        ctx.reviews()
            .add("Cafe X", Rating::new(4).unwrap(), "good")
            .unwrap();
        ctx.shutdown();

        let reopened = context(&backend);
        let summary = reopened.open().unwrap();
        assert_eq!(summary.restaurants, 1);
        assert_eq!(summary.reviews, 1);
        assert_eq!(reopened.restaurants().get("Cafe X").unwrap().rating(), 4.0);
    }

    #[test]
    fn shutdown_is_idempotent_and_closes_handle() {
        let ctx = context(&MemoryBackend::new());
        ctx.open().unwrap();
        assert!(ctx.shutdown());
        assert!(ctx.shutdown());
        assert_eq!(ctx.handle().state(), HandleState::Closed);
    }

    #[test]
    fn periodic_refresh_picks_up_external_rows() {
        let backend = MemoryBackend::new();
        let ctx = AppContext::builder(
            Arc::new(backend.clone()),
            Arc::new(SqliteDialect::new("unused.db")),
        )
        .config(Config::fast().refresh_interval(Some(Duration::from_millis(50))))
        .build()
        .unwrap();
        ctx.open().unwrap();

        let mut tables = backend.snapshot();
        tables.restaurant_seq += 1;
        let id = bistro_store::RestaurantId::new(tables.restaurant_seq);
        tables.restaurants.insert(
            id,
            Restaurant::from_stored(id, "Outside".into(), "Elsewhere".into(), 0.0).unwrap(),
        );
        backend.replace(tables);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ctx.restaurants().contains("Outside") {
            assert!(std::time::Instant::now() < deadline, "refresh never ran");
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}
