//! JSON snapshots of the cached data.
//!
//! An export writes what both caches hold at one instant. An import checks
//! a snapshot file completely, replaces both tables with its contents in a
//! single store transaction and then reloads the caches.
//!
//! Store-assigned ids are not preserved across an import. Reviews are
//! re-linked to their restaurants through the ids the store hands out
//! while the snapshot is written back.

use crate::cache::{CacheSet, ReloadSummary};
use crate::error::{CoreError, CoreResult};
use bistro_store::{
    Rating, Restaurant, RestaurantId, Review, ReviewId, StoreError, StoreResult, StoreSession,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Tag stored in every snapshot file.
pub const SNAPSHOT_FORMAT: &str = "bistro-snapshot";

/// Layout version written by this build; older versions are still read.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Contents of a snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Always [`SNAPSHOT_FORMAT`].
    pub format: String,
    /// Layout version.
    pub version: u32,
    /// When the export ran.
    pub exported_at: DateTime<Utc>,
    /// Restaurants, ordered by name.
    pub restaurants: Vec<RestaurantRecord>,
    /// Reviews, ordered by id.
    pub reviews: Vec<ReviewRecord>,
}

/// A restaurant as written to a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestaurantRecord {
    /// Id at export time.
    pub id: RestaurantId,
    /// Unique name.
    pub name: String,
    /// Free-text location.
    pub location: String,
    /// Derived rating; recomputed after import.
    #[serde(default)]
    pub rating: f64,
}

/// A review as written to a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    /// Id at export time.
    pub id: ReviewId,
    /// Id of the reviewed restaurant within the same snapshot.
    pub restaurant_id: RestaurantId,
    /// Score in `1..=5`.
    pub rating: Rating,
    /// Free text.
    #[serde(default)]
    pub comment: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last edit, if any.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of [`CacheSet::export_snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    /// File written.
    pub path: PathBuf,
    /// Restaurants written.
    pub restaurants: usize,
    /// Reviews written.
    pub reviews: usize,
    /// File size in bytes.
    pub size: u64,
    /// Timestamp recorded in the file.
    pub exported_at: DateTime<Utc>,
}

/// Result of [`CacheSet::import_snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    /// File read.
    pub path: PathBuf,
    /// When the snapshot was taken.
    pub exported_at: DateTime<Utc>,
    /// Restaurants deleted from the store before the import.
    pub removed_restaurants: usize,
    /// Reviews deleted from the store before the import.
    pub removed_reviews: usize,
    /// What the caches hold afterwards.
    pub loaded: ReloadSummary,
}

impl Snapshot {
    /// Copies both caches while holding their read locks.
    pub fn capture(caches: &CacheSet) -> CoreResult<Self> {
        let review_map = caches.reviews.core().map().read();
        let restaurant_map = caches.restaurants.core().map().read();

        let restaurants = restaurant_map
            .values()
            .map(|r| {
                let id = r.id().ok_or_else(|| {
                    let message = format!("cached restaurant '{}' has no id", r.name());
                    CoreError::invalid_operation(message)
                })?;
                Ok(RestaurantRecord {
                    id,
                    name: r.name().to_string(),
                    location: r.location().to_string(),
                    rating: r.rating(),
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        let reviews = review_map
            .iter()
            .map(|(id, r)| ReviewRecord {
                id: *id,
                restaurant_id: r.restaurant_id(),
                rating: r.rating(),
                comment: r.comment().to_string(),
                created_at: r.created_at(),
                updated_at: r.updated_at(),
            })
            .collect();

        Ok(Self {
            format: SNAPSHOT_FORMAT.to_string(),
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            restaurants,
            reviews,
        })
    }

    /// Parses and checks a snapshot file. Nothing is written anywhere.
    pub fn read(path: &Path) -> CoreResult<Self> {
        Self::load(path).map(|(snapshot, _)| snapshot)
    }

    fn load(path: &Path) -> CoreResult<(Self, Vec<Restaurant>)> {
        let label = path.display().to_string();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CoreError::invalid_snapshot(&label, "file not found")
            } else {
                CoreError::Io(e)
            }
        })?;
        let snapshot: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| CoreError::invalid_snapshot(&label, e.to_string()))?;
        let restaurants = snapshot
            .check()
            .map_err(|reason| CoreError::invalid_snapshot(&label, reason))?;
        Ok((snapshot, restaurants))
    }

    /// Validates every row and cross-reference, returning the restaurants
    /// as domain values.
    fn check(&self) -> Result<Vec<Restaurant>, String> {
        if self.format != SNAPSHOT_FORMAT {
            return Err(format!("unexpected format '{}'", self.format));
        }
        if self.version == 0 || self.version > SNAPSHOT_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }

        let mut ids = HashSet::with_capacity(self.restaurants.len());
        let mut names = HashSet::with_capacity(self.restaurants.len());
        let mut restaurants = Vec::with_capacity(self.restaurants.len());
        for record in &self.restaurants {
            let restaurant = Restaurant::from_stored(
                record.id,
                record.name.clone(),
                record.location.clone(),
                record.rating,
            )
            .map_err(|e| format!("restaurant {}: {e}", record.id))?;
            if !ids.insert(record.id) {
                return Err(format!("duplicate restaurant id {}", record.id));
            }
            if !names.insert(restaurant.name().to_string()) {
                return Err(format!("duplicate restaurant name '{}'", restaurant.name()));
            }
            restaurants.push(restaurant);
        }

        let mut review_ids = HashSet::with_capacity(self.reviews.len());
        for record in &self.reviews {
            if !review_ids.insert(record.id) {
                return Err(format!("duplicate review id {}", record.id));
            }
            if !ids.contains(&record.restaurant_id) {
                return Err(format!(
                    "review {} refers to missing restaurant {}",
                    record.id, record.restaurant_id
                ));
            }
            if record.updated_at.is_some_and(|at| at < record.created_at) {
                return Err(format!("review {} was edited before it was created", record.id));
            }
        }
        Ok(restaurants)
    }

    /// Writes the snapshot as pretty JSON, replacing `path`.
    ///
    /// The file is written beside `path` first and renamed into place, so
    /// a failed export never leaves a truncated snapshot behind. Returns
    /// the size of the file.
    pub fn write(&self, path: &Path) -> CoreResult<u64> {
        let partial = partial_path(path);
        if let Err(e) = write_json(self, &partial) {
            if let Err(cleanup) = fs::remove_file(&partial) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        file = %partial.display(),
                        error = %cleanup,
                        "could not remove partial snapshot"
                    );
                }
            }
            return Err(e.into());
        }
        fs::rename(&partial, path)?;
        Ok(fs::metadata(path)?.len())
    }

    /// Deletes every row and inserts the snapshot's rows. Runs inside the
    /// caller's transaction.
    fn replace_store(
        &self,
        restaurants: &[Restaurant],
        tx: &mut dyn StoreSession,
    ) -> StoreResult<(usize, usize)> {
        let existing = tx.restaurants()?;
        let mut removed_reviews = 0;
        for restaurant in &existing {
            if let Some(id) = restaurant.id() {
                removed_reviews += tx.delete_reviews_for(id)?;
                tx.delete_restaurant(id)?;
            }
        }

        let mut assigned: HashMap<RestaurantId, RestaurantId> =
            HashMap::with_capacity(restaurants.len());
        for restaurant in restaurants {
            let id = tx.insert_restaurant(restaurant)?;
            if let Some(exported) = restaurant.id() {
                assigned.insert(exported, id);
            }
        }
        for record in &self.reviews {
            let restaurant_id = *assigned.get(&record.restaurant_id).ok_or_else(|| {
                let detail = format!("restaurant {} was not imported", record.restaurant_id);
                StoreError::Constraint(detail)
            })?;
            tx.insert_review(&Review::from_stored(
                record.id,
                restaurant_id,
                record.rating,
                record.comment.clone(),
                record.created_at,
                record.updated_at,
            ))?;
        }
        Ok((existing.len(), removed_reviews))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

fn write_json(snapshot: &Snapshot, path: &Path) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut out, snapshot)?;
    out.write_all(b"\n")?;
    out.into_inner().map_err(io::IntoInnerError::into_error)?.sync_all()
}

impl CacheSet {
    /// Writes both caches to `path` as a JSON snapshot.
    ///
    /// The caches are copied under their read locks, so the file reflects
    /// a single instant; the file itself is written after the locks are
    /// released.
    pub fn export_snapshot(&self, path: &Path) -> CoreResult<ExportReport> {
        let snapshot = Snapshot::capture(self)?;
        let size = snapshot.write(path)?;
        tracing::info!(
            file = %path.display(),
            restaurants = snapshot.restaurants.len(),
            reviews = snapshot.reviews.len(),
            size,
            "snapshot exported"
        );
        Ok(ExportReport {
            path: path.to_path_buf(),
            restaurants: snapshot.restaurants.len(),
            reviews: snapshot.reviews.len(),
            size,
            exported_at: snapshot.exported_at,
        })
    }

    /// Replaces the store's contents with the snapshot at `path`.
    ///
    /// The whole file is parsed and checked first; an invalid file fails
    /// with [`CoreError::InvalidSnapshot`] and leaves the store untouched.
    /// Both tables are then rewritten in one transaction while both cache
    /// write locks are held, and the caches are reloaded. If that reload
    /// fails the store already holds the snapshot and the error is
    /// returned.
    pub fn import_snapshot(&self, path: &Path) -> CoreResult<ImportReport> {
        let (snapshot, restaurants) = Snapshot::load(path)?;

        let (removed_restaurants, removed_reviews) = {
            let _reviews = self.reviews.core().write();
            let _restaurants = self.restaurants.core().write();
            self.restaurants
                .core()
                .in_transaction(|tx| snapshot.replace_store(&restaurants, tx))?
        };
        tracing::info!(
            file = %path.display(),
            removed_restaurants,
            removed_reviews,
            restaurants = snapshot.restaurants.len(),
            reviews = snapshot.reviews.len(),
            "snapshot written to store"
        );

        let loaded = self.reload_all()?;
        Ok(ImportReport {
            path: path.to_path_buf(),
            exported_at: snapshot.exported_at,
            removed_restaurants,
            removed_reviews,
            loaded,
        })
    }
}
