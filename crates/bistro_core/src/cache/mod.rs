//! Write-through entity caches.
//!
//! Each cache owns an in-memory map guarded by its own ranked read/write
//! lock. Mutations take the write lock, persist through the
//! [`PersistenceHandle`] inside a store transaction, update the map only
//! after the store accepted the change, release the lock and then notify
//! the [`ChangeFeed`].
//!
//! The map is a snapshot of the store as of the last successful sync.
//! After a failed reload it is left empty and [`SyncStatus::Failed`] is
//! reported instead of pretending to be populated.

mod base;
mod restaurant;
mod review;

pub use base::SyncStatus;
pub use restaurant::RestaurantCache;
pub use review::ReviewCache;

use crate::change_feed::ChangeFeed;
use crate::concurrency::Executors;
use crate::config::Config;
use crate::consistency::RatingSync;
use crate::error::{CoreError, CoreResult};
use crate::handle::PersistenceHandle;
use bistro_store::StoreError;
use serde::Serialize;
use std::sync::Arc;

/// Collaborators shared by every cache.
#[derive(Debug, Clone)]
pub struct CacheDeps {
    /// Session source.
    pub handle: Arc<PersistenceHandle>,
    /// Pools for reloads and async APIs.
    pub executors: Arc<Executors>,
    /// Where change notifications go.
    pub feed: Arc<ChangeFeed>,
    /// Retry and epsilon settings.
    pub config: Arc<Config>,
}

/// Counts from a full reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    /// Restaurants loaded.
    pub restaurants: usize,
    /// Reviews loaded.
    pub reviews: usize,
    /// Restaurants whose stored rating had to be corrected.
    pub ratings_fixed: usize,
}

/// Both caches plus the rating sync, wired together.
#[derive(Debug, Clone)]
pub struct CacheSet {
    /// Restaurants keyed by name.
    pub restaurants: Arc<RestaurantCache>,
    /// Reviews keyed by id.
    pub reviews: Arc<ReviewCache>,
    /// Rating recomputation.
    pub ratings: Arc<RatingSync>,
}

impl CacheSet {
    /// Builds the caches over `deps`. Nothing is loaded yet.
    pub fn new(deps: CacheDeps) -> Self {
        let restaurants = Arc::new(RestaurantCache::new(deps.clone()));
        let ratings = Arc::new(RatingSync::new(
            Arc::clone(&restaurants),
            deps.config.rating_epsilon,
            Arc::clone(deps.executors.errors()),
        ));
        let reviews = Arc::new(ReviewCache::new(
            deps,
            Arc::clone(&restaurants),
            Arc::clone(&ratings),
        ));
        restaurants.attach_reviews(&reviews);
        Self {
            restaurants,
            reviews,
            ratings,
        }
    }

    /// Reloads restaurants, then reviews, then reconciles ratings.
    ///
    /// Both caches are reloaded even if the first fails; the first error
    /// is returned.
    pub fn reload_all(&self) -> CoreResult<ReloadSummary> {
        let restaurants = self.restaurants.reload();
        let reviews = self.reviews.reload();
        let restaurants = restaurants?;
        let reviews = reviews?;
        let ratings_fixed = self.ratings.reconcile_all(&self.reviews)?;
        Ok(ReloadSummary {
            restaurants,
            reviews,
            ratings_fixed,
        })
    }
}

/// Maps a store constraint failure to the given domain error.
pub(crate) fn on_constraint(err: CoreError, mapped: impl FnOnce() -> CoreError) -> CoreError {
    match err {
        CoreError::Store(StoreError::Constraint(detail)) => {
            tracing::debug!(%detail, "store constraint violated");
            mapped()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_feed::{ChangeKind, EntityKind};
    use bistro_store::{MemoryBackend, Rating, Restaurant};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        backend: MemoryBackend,
        executors: Arc<Executors>,
        handle: Arc<PersistenceHandle>,
        caches: CacheSet,
        feed: Arc<ChangeFeed>,
    }

    fn fixture_with(config: Config) -> Fixture {
        let backend = MemoryBackend::new();
        let config = Arc::new(config);
        let executors = Arc::new(Executors::new(&config).unwrap());
        let handle = Arc::new(PersistenceHandle::new(Arc::new(backend.clone()), &config));
        let feed = Arc::new(ChangeFeed::new());
        let caches = CacheSet::new(CacheDeps {
            handle: Arc::clone(&handle),
            executors: Arc::clone(&executors),
            feed: Arc::clone(&feed),
            config,
        });
        caches.reload_all().unwrap();
        Fixture {
            backend,
            executors,
            handle,
            caches,
            feed,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config::fast())
    }

    fn restaurant(name: &str) -> Restaurant {
        Restaurant::new(name, "Somewhere").unwrap()
    }

    fn rating(value: i64) -> Rating {
        Rating::new(value).unwrap()
    }

    #[test]
    fn duplicate_name_is_rejected_and_size_unchanged() {
        let f = fixture();
        f.caches.restaurants.add(restaurant("Cafe X")).unwrap();
        let err = f.caches.restaurants.add(restaurant("Cafe X")).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKey { .. }));
        assert_eq!(f.caches.restaurants.len(), 1);
        assert_eq!(f.backend.snapshot().restaurants.len(), 1);

        // Names are case-sensitive.
        f.caches.restaurants.add(restaurant("cafe x")).unwrap();
        assert_eq!(f.caches.restaurants.len(), 2);
    }

    #[test]
    fn failed_write_leaves_map_untouched() {
        let f = fixture();
        f.backend.fail_next_writes(1);
        let err = f.caches.restaurants.add(restaurant("Cafe X")).unwrap_err();
        assert!(err.is_retryable());
        assert!(f.caches.restaurants.is_empty());
        assert!(f.backend.snapshot().restaurants.is_empty());

        f.caches.restaurants.add(restaurant("Cafe X")).unwrap();
        assert_eq!(f.caches.restaurants.len(), 1);
    }

    #[test]
    fn rename_moves_key_and_reports_previous() {
        let f = fixture();
        let saved = f.caches.restaurants.add(restaurant("Old Name")).unwrap();
        let rx = f.feed.subscribe();

        let mut edited = saved.clone();
        edited.rename("New Name").unwrap();
        let updated = f.caches.restaurants.update(&edited).unwrap();

        assert_eq!(updated.id(), saved.id());
        assert!(f.caches.restaurants.get("Old Name").is_none());
        assert_eq!(f.caches.restaurants.get("New Name").unwrap().id(), saved.id());
        let event = rx.recv().unwrap();
        assert_eq!(event.key, "New Name");
        assert_eq!(
            event.kind,
            ChangeKind::Update {
                previous_key: Some("Old Name".to_string())
            }
        );
    }

    #[test]
    fn update_without_id_falls_back_to_name() {
        let f = fixture();
        f.caches.restaurants.add(restaurant("Diner")).unwrap();
        let edited = Restaurant::new("Diner", "Main St").unwrap();
        let updated = f.caches.restaurants.update(&edited).unwrap();
        assert_eq!(updated.location(), "Main St");

        let missing = Restaurant::new("Nowhere", "x").unwrap();
        assert!(matches!(
            f.caches.restaurants.update(&missing),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn rename_onto_existing_name_is_rejected() {
        let f = fixture();
        let a = f.caches.restaurants.add(restaurant("A")).unwrap();
        f.caches.restaurants.add(restaurant("B")).unwrap();
        let mut edited = a;
        edited.rename("B").unwrap();
        assert!(matches!(
            f.caches.restaurants.update(&edited),
            Err(CoreError::DuplicateKey { .. })
        ));
        assert!(f.caches.restaurants.contains("A"));
    }

    #[test]
    fn ratings_follow_review_mutations() {
        let f = fixture();
        f.caches.restaurants.add(restaurant("Cafe X")).unwrap();
        let four = f.caches.reviews.add("Cafe X", rating(4), "good").unwrap();
        f.caches.reviews.add("Cafe X", rating(2), "meh").unwrap();
        assert_eq!(f.caches.restaurants.get("Cafe X").unwrap().rating(), 3.0);

        f.caches.reviews.update(four.id().unwrap(), Some(rating(5)), None).unwrap();
        assert_eq!(f.caches.restaurants.get("Cafe X").unwrap().rating(), 3.5);
        assert_eq!(f.caches.reviews.average_rating("Cafe X").unwrap(), 3.5);

        f.caches.reviews.delete(four.id().unwrap()).unwrap();
        assert_eq!(f.caches.restaurants.get("Cafe X").unwrap().rating(), 2.0);

        let stored = f.backend.snapshot();
        let row = stored.restaurants.values().next().unwrap();
        assert_eq!(row.rating(), 2.0);
    }

    #[test]
    fn review_for_unknown_restaurant_is_not_found() {
        let f = fixture();
        let err = f.caches.reviews.add("Ghost", rating(3), "").unwrap_err();
        assert!(matches!(
            err,
            CoreError::NotFound {
                entity: EntityKind::Restaurant,
                ..
            }
        ));
        assert!(f.caches.reviews.is_empty());
    }

    #[test]
    fn review_edit_sets_updated_at() {
        let f = fixture();
        f.caches.restaurants.add(restaurant("Cafe X")).unwrap();
        let review = f.caches.reviews.add("Cafe X", rating(3), "  ok  ").unwrap();
        assert_eq!(review.comment(), "ok");
        assert!(review.updated_at().is_none());
        let edited = f
            .caches
            .reviews
            .update(review.id().unwrap(), None, Some("better"))
            .unwrap();
        assert_eq!(edited.comment(), "better");
        assert!(edited.updated_at().is_some());
        assert_eq!(
            f.caches.reviews.restaurant_name(&edited).as_deref(),
            Some("Cafe X")
        );
    }

    #[test]
    fn delete_cascades_reviews() {
        let f = fixture();
        f.caches.restaurants.add(restaurant("Cafe X")).unwrap();
        f.caches.restaurants.add(restaurant("Other")).unwrap();
        f.caches.reviews.add("Cafe X", rating(4), "").unwrap();
        f.caches.reviews.add("Cafe X", rating(2), "").unwrap();
        f.caches.reviews.add("Other", rating(5), "").unwrap();

        assert_eq!(f.caches.restaurants.delete("Cafe X").unwrap(), 2);
        assert!(f.caches.restaurants.get("Cafe X").is_none());
        assert!(f.caches.reviews.for_restaurant("Cafe X").is_empty());
        assert_eq!(f.caches.reviews.len(), 1);

        let stored = f.backend.snapshot();
        assert_eq!(stored.restaurants.len(), 1);
        assert_eq!(stored.reviews.len(), 1);

        assert!(matches!(
            f.caches.restaurants.delete("Cafe X"),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn reload_mirrors_external_changes() {
        let f = fixture();
        f.caches.restaurants.add(restaurant("Kept")).unwrap();

        let mut tables = f.backend.snapshot();
        tables.restaurant_seq += 1;
        let id = bistro_store::RestaurantId::new(tables.restaurant_seq);
        tables.restaurants.insert(
            id,
            Restaurant::from_stored(id, "External".into(), "Far".into(), 0.0).unwrap(),
        );
        f.backend.replace(tables);

        assert!(!f.caches.restaurants.contains("External"));
        let summary = f.caches.reload_all().unwrap();
        assert_eq!(summary.restaurants, 2);
        let names: Vec<String> = f
            .caches
            .restaurants
            .list()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, ["External", "Kept"]);
        assert!(f.caches.restaurants.sync_status().is_synced());
    }

    #[test]
    fn reload_gives_up_with_empty_map() {
        let f = fixture_with(Config::fast().reload_attempts(2));
        f.caches.restaurants.add(restaurant("Cafe X")).unwrap();
        let rx = f.feed.subscribe();
        f.backend.set_offline(true);

        let err = f.caches.restaurants.reload().unwrap_err();
        assert!(matches!(err, CoreError::Sync { attempts: 2, .. }));
        assert!(f.caches.restaurants.is_empty());
        assert!(matches!(
            f.caches.restaurants.sync_status(),
            SyncStatus::Failed { .. }
        ));
        let failed = rx
            .try_iter()
            .any(|e| matches!(e.kind, ChangeKind::SyncFailed { .. }));
        assert!(failed);

        f.backend.set_offline(false);
        assert_eq!(f.caches.restaurants.reload().unwrap(), 1);
    }

    #[test]
    fn reload_recovers_after_transient_outage() {
        let f = fixture_with(Config::fast().reload_attempts(3));
        f.caches.restaurants.add(restaurant("Cafe X")).unwrap();
        f.handle.close();
        f.backend.fail_next_connects(1);
        assert_eq!(f.caches.restaurants.reload().unwrap(), 1);
    }

    #[test]
    fn concurrent_adds_and_deletes_keep_counts() {
        let f = fixture();
        let threads = 8;
        let per_thread = 20;
        thread::scope(|s| {
            for t in 0..threads {
                let caches = &f.caches;
                s.spawn(move || {
                    for i in 0..per_thread {
                        let name = format!("r-{t}-{i}");
                        caches.restaurants.add(restaurant(&name)).unwrap();
                        // Every thread also races on one shared name.
                        let _ = caches.restaurants.add(restaurant("shared"));
                        if i % 2 == 0 {
                            caches.restaurants.delete(&name).unwrap();
                        }
                    }
                });
            }
        });
        let expected = threads * per_thread / 2 + 1;
        assert_eq!(f.caches.restaurants.len(), expected);
        assert_eq!(f.backend.snapshot().restaurants.len(), expected);
    }

    #[test]
    fn concurrent_reviews_keep_rating_consistent() {
        let f = fixture();
        f.caches.restaurants.add(restaurant("Busy")).unwrap();
        thread::scope(|s| {
            for t in 0..4i64 {
                let caches = &f.caches;
                s.spawn(move || {
                    for i in 0..10i64 {
                        caches
                            .reviews
                            .add("Busy", rating((t + i) % 5 + 1), "")
                            .unwrap();
                    }
                });
            }
        });
        let reviews = f.caches.reviews.for_restaurant("Busy");
        assert_eq!(reviews.len(), 40);
        let mean = crate::mean_rating(reviews.iter().map(|r| r.rating()));
        let cached = f.caches.restaurants.get("Busy").unwrap().rating();
        assert!((cached - mean).abs() < 1e-9);
    }

    #[test]
    fn writers_proceed_while_reload_waits_for_io() {
        let f = fixture();
        let gates: Vec<mpsc::Sender<()>> = (0..f.executors.io().size())
            .map(|_| {
                let (tx, rx) = mpsc::channel::<()>();
                f.executors
                    .io()
                    .execute("occupy", move || {
                        let _ = rx.recv();
                    })
                    .unwrap();
                tx
            })
            .collect();

        let restaurants = Arc::clone(&f.caches.restaurants);
        let reloader = thread::spawn(move || restaurants.reload());
        thread::sleep(Duration::from_millis(50));

        let (done_tx, done_rx) = mpsc::channel();
        let restaurants = Arc::clone(&f.caches.restaurants);
        thread::spawn(move || {
            let _ = done_tx.send(restaurants.add(restaurant("During Reload")));
        });
        let added = done_rx.recv_timeout(Duration::from_secs(2));
        drop(gates);

        assert!(added.expect("add blocked behind a pending reload").is_ok());
        assert_eq!(reloader.join().unwrap().unwrap(), 1);
        assert!(f.caches.restaurants.contains("During Reload"));
        assert_eq!(f.backend.snapshot().restaurants.len(), 1);
    }

    #[test]
    fn reload_racing_a_write_keeps_cache_and_store_equal() {
        let f = fixture();
        f.caches.restaurants.add(restaurant("Before")).unwrap();

        let restaurants = Arc::clone(&f.caches.restaurants);
        let reloader = thread::spawn(move || restaurants.reload());
        f.caches.restaurants.add(restaurant("Racing")).unwrap();
        reloader.join().unwrap().unwrap();

        assert_eq!(f.caches.restaurants.len(), 2);
        assert_eq!(f.backend.snapshot().restaurants.len(), 2);
    }
}
