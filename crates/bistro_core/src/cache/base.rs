//! Shared map, sync status and reload loop behind both caches.

use super::CacheDeps;
use crate::change_feed::{ChangeKind, EntityKind};
use crate::concurrency::{LockRank, RankedRwLock, RankedWriteGuard};
use crate::error::{CoreError, CoreResult};
use bistro_store::{transaction, StoreResult, StoreSession};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

/// Outcome of the most recent reload of a cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncStatus {
    /// No reload has run yet.
    NeverSynced,
    /// The map mirrors the store as of `at`.
    Synced {
        /// Entries loaded.
        count: usize,
        /// Completion time.
        at: DateTime<Utc>,
    },
    /// The last reload gave up. The map is empty and must not be trusted.
    Failed {
        /// Last underlying error.
        message: String,
        /// When the reload gave up.
        at: DateTime<Utc>,
    },
}

impl SyncStatus {
    /// Returns true if the map reflects a successful sync.
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncStatus::Synced { .. })
    }
}

/// Fetches retried after a concurrent write before falling back to an
/// inline fetch under the write lock.
const STALE_REFETCHES: usize = 3;

pub(crate) struct CacheCore<K, V> {
    entity: EntityKind,
    map: RankedRwLock<BTreeMap<K, V>>,
    /// Bumped on every write-lock acquisition.
    version: AtomicU64,
    status: Mutex<SyncStatus>,
    pub(crate) deps: CacheDeps,
}

impl<K, V> CacheCore<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub(crate) fn new(entity: EntityKind, rank: LockRank, deps: CacheDeps) -> Self {
        Self {
            entity,
            map: RankedRwLock::new(rank, BTreeMap::new()),
            version: AtomicU64::new(0),
            status: Mutex::new(SyncStatus::NeverSynced),
            deps,
        }
    }

    pub(crate) fn map(&self) -> &RankedRwLock<BTreeMap<K, V>> {
        &self.map
    }

    /// Takes the write lock and marks the map as changed.
    ///
    /// Every mutation goes through here so a reload can tell whether its
    /// snapshot went stale while it was being fetched.
    pub(crate) fn write(&self) -> RankedWriteGuard<'_, BTreeMap<K, V>> {
        let guard = self.map.write();
        self.version.fetch_add(1, Ordering::SeqCst);
        guard
    }

    /// Version of the map once no writer holds it.
    fn settled_version(&self) -> u64 {
        self.map.with_read(|_| self.version.load(Ordering::SeqCst))
    }

    pub(crate) fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    pub(crate) fn emit(&self, kind: ChangeKind, key: impl Into<String>) {
        self.deps.feed.emit(self.entity, kind, key);
    }

    /// Runs `f` inside a store transaction on a pooled session.
    pub(crate) fn in_transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn StoreSession) -> StoreResult<T>,
    ) -> CoreResult<T> {
        self.deps
            .handle
            .with_session(|s| transaction(s, |tx| f(tx).map_err(CoreError::from)))
    }

    /// Runs a read-only `f` on a pooled session.
    pub(crate) fn query<T>(
        &self,
        f: impl FnOnce(&mut dyn StoreSession) -> StoreResult<T>,
    ) -> CoreResult<T> {
        self.deps.handle.with_session(|s| f(s).map_err(CoreError::from))
    }

    pub(crate) fn values(&self) -> Vec<V> {
        self.map.with_read(|m| m.values().cloned().collect())
    }

    pub(crate) fn len(&self) -> usize {
        self.map.with_read(BTreeMap::len)
    }

    /// Runs one fetch on the I/O pool, or inline when already on it.
    fn fetch<F>(&self, fetch: &F) -> CoreResult<Vec<(K, V)>>
    where
        F: Fn(&mut dyn StoreSession) -> CoreResult<Vec<(K, V)>> + Clone + Send + 'static,
    {
        let io = self.deps.executors.io();
        if io.is_current() {
            return self.deps.handle.with_session(|s| fetch(s));
        }
        let handle = Arc::clone(&self.deps.handle);
        let fetch = fetch.clone();
        io.spawn(&format!("reload {}s", self.entity), move || {
            handle.with_session(|s| fetch(s))
        })?
        .join()
    }

    /// One reload attempt. Returns the number of entries swapped in.
    fn fetch_current<F>(&self, fetch: &F) -> CoreResult<usize>
    where
        F: Fn(&mut dyn StoreSession) -> CoreResult<Vec<(K, V)>> + Clone + Send + 'static,
    {
        for _ in 0..STALE_REFETCHES {
            let seen = self.settled_version();
            let entries = self.fetch(fetch)?;
            let mut map = self.map.write();
            if self.version.fetch_add(1, Ordering::SeqCst) == seen {
                *map = entries.into_iter().collect();
                return Ok(map.len());
            }
            drop(map);
            tracing::debug!(entity = %self.entity, "map changed during fetch, fetching again");
        }

        let mut map = self.write();
        let entries = self.deps.handle.with_session(|s| fetch(s))?;
        *map = entries.into_iter().collect();
        Ok(map.len())
    }

    /// Replaces the map with a fresh snapshot of the store.
    ///
    /// The snapshot is fetched without holding the write lock, so a reload
    /// never blocks on a queued I/O task while other writers wait on it.
    /// The map is swapped in only if no write happened during the fetch;
    /// otherwise the fetch is repeated, and the last try fetches inline on
    /// the calling thread under the write lock. Readers never see a
    /// partially filled map.
    ///
    /// Failed attempts back off and restart the persistence handle before
    /// retrying. After the last failure the map is emptied and
    /// [`CoreError::Sync`] is returned.
    pub(crate) fn reload<F>(&self, fetch: F) -> CoreResult<usize>
    where
        F: Fn(&mut dyn StoreSession) -> CoreResult<Vec<(K, V)>> + Clone + Send + 'static,
    {
        let attempts = self.deps.config.reload_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.fetch_current(&fetch) {
                Ok(count) => {
                    *self.status.lock() = SyncStatus::Synced {
                        count,
                        at: Utc::now(),
                    };
                    tracing::info!(entity = %self.entity, count, attempt, "cache reloaded");
                    self.emit(ChangeKind::Reloaded { count }, "");
                    return Ok(count);
                }
                Err(e) => {
                    tracing::warn!(
                        entity = %self.entity,
                        attempt,
                        error = %e,
                        "cache reload attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        thread::sleep(self.deps.config.reload_backoff * attempt);
                        if let Err(e) = self.deps.handle.restart() {
                            tracing::warn!(
                                entity = %self.entity,
                                error = %e,
                                "handle restart failed"
                            );
                        }
                    }
                }
            }
        }
        self.write().clear();

        *self.status.lock() = SyncStatus::Failed {
            message: last_error.clone(),
            at: Utc::now(),
        };
        tracing::error!(
            entity = %self.entity,
            attempts,
            error = %last_error,
            "cache sync failed"
        );
        self.emit(
            ChangeKind::SyncFailed {
                message: last_error.clone(),
            },
            "",
        );
        Err(CoreError::Sync {
            entity: self.entity,
            attempts,
            message: last_error,
        })
    }
}
