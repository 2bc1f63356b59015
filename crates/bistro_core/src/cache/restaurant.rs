//! Restaurant cache keyed by name.

use super::base::{CacheCore, SyncStatus};
use super::review::ReviewCache;
use super::{on_constraint, CacheDeps};
use crate::change_feed::{ChangeKind, EntityKind};
use crate::concurrency::{LockRank, TaskHandle};
use crate::error::{CoreError, CoreResult};
use bistro_store::{Restaurant, RestaurantId, ReviewId};
use std::sync::{Arc, OnceLock, Weak};

/// Write-through cache of restaurants keyed by their unique name.
///
/// # Example
///
/// ```rust,ignore
/// let saved = ctx.restaurants().add(Restaurant::new("Cafe X", "Downtown")?)?;
/// assert!(ctx.restaurants().add(Restaurant::new("Cafe X", "Uptown")?).is_err());
/// ```
pub struct RestaurantCache {
    core: CacheCore<String, Restaurant>,
    reviews: OnceLock<Weak<ReviewCache>>,
}

impl RestaurantCache {
    /// Creates an empty cache.
    pub fn new(deps: CacheDeps) -> Self {
        Self {
            core: CacheCore::new(EntityKind::Restaurant, LockRank::Restaurant, deps),
            reviews: OnceLock::new(),
        }
    }

    pub(crate) fn core(&self) -> &CacheCore<String, Restaurant> {
        &self.core
    }

    /// Links the review cache used for cascading deletes.
    pub(crate) fn attach_reviews(&self, reviews: &Arc<ReviewCache>) {
        if self.reviews.set(Arc::downgrade(reviews)).is_err() {
            tracing::warn!("review cache already attached");
        }
    }

    /// Adds a new restaurant.
    ///
    /// Fails with [`CoreError::DuplicateKey`] if the name is taken; the
    /// cache is left unchanged. Returns the saved restaurant with its id.
    pub fn add(&self, restaurant: Restaurant) -> CoreResult<Restaurant> {
        let name = restaurant.name().to_string();
        let mut map = self.core.write();
        if map.contains_key(&name) {
            return Err(CoreError::duplicate(EntityKind::Restaurant, name));
        }

        let id = self
            .core
            .in_transaction(|tx| tx.insert_restaurant(&restaurant))
            .map_err(|e| on_constraint(e, || CoreError::duplicate(EntityKind::Restaurant, &name)))?;

        let mut saved = restaurant;
        saved.assign_id(id);
        map.insert(name.clone(), saved.clone());
        drop(map);

        tracing::info!(restaurant = %name, %id, "restaurant added");
        self.core.emit(ChangeKind::Insert, name);
        Ok(saved)
    }

    /// Applies the name and location of `edited` to the stored record.
    ///
    /// The record is found by id, or by name when `edited` has no id. The
    /// stored rating is kept. A rename moves the map entry to the new key.
    pub fn update(&self, edited: &Restaurant) -> CoreResult<Restaurant> {
        let mut map = self.core.write();

        let lookup_key = edited
            .id()
            .map_or_else(|| edited.name().to_string(), |id| id.to_string());
        let current = self
            .core
            .query(|s| match edited.id() {
                Some(id) => s.restaurant_by_id(id),
                None => s.restaurant_by_name(edited.name()),
            })?
            .ok_or_else(|| CoreError::not_found(EntityKind::Restaurant, &lookup_key))?;

        let previous = current.name().to_string();
        let mut next = current.clone();
        next.rename(edited.name())?;
        next.relocate(edited.location())?;
        if next == current {
            return Ok(current);
        }

        let renamed = next.name() != previous;
        if renamed && map.contains_key(next.name()) {
            return Err(CoreError::duplicate(EntityKind::Restaurant, next.name()));
        }

        self.core
            .in_transaction(|tx| tx.update_restaurant(&next))
            .map_err(|e| {
                on_constraint(e, || CoreError::duplicate(EntityKind::Restaurant, next.name()))
            })?;

        map.remove(&previous);
        map.insert(next.name().to_string(), next.clone());
        drop(map);

        tracing::info!(restaurant = %next.name(), renamed, "restaurant updated");
        self.core.emit(
            ChangeKind::Update {
                previous_key: renamed.then_some(previous),
            },
            next.name(),
        );
        Ok(next)
    }

    /// Deletes a restaurant and all of its reviews.
    ///
    /// Takes the review cache lock before its own, so the cascade is
    /// atomic with respect to review mutations. Returns how many reviews
    /// were removed.
    pub fn delete(&self, name: &str) -> CoreResult<usize> {
        let reviews = self.reviews.get().and_then(Weak::upgrade);
        let mut review_map = reviews.as_ref().map(|r| r.core().write());
        let mut map = self.core.write();

        let id = map
            .get(name)
            .ok_or_else(|| CoreError::not_found(EntityKind::Restaurant, name))?
            .id()
            .ok_or_else(|| {
                CoreError::invalid_operation(format!("cached restaurant '{name}' has no id"))
            })?;

        let (removed_rows, existed) = self.core.in_transaction(|tx| {
            let removed = tx.delete_reviews_for(id)?;
            let existed = tx.delete_restaurant(id)?;
            Ok((removed, existed))
        })?;
        if !existed {
            tracing::warn!(restaurant = %name, "restaurant row was already gone from the store");
        }

        map.remove(name);
        let dropped: Vec<ReviewId> = match review_map.as_mut() {
            Some(reviews) => {
                let ids: Vec<ReviewId> = reviews
                    .iter()
                    .filter(|(_, r)| r.restaurant_id() == id)
                    .map(|(rid, _)| *rid)
                    .collect();
                for rid in &ids {
                    reviews.remove(rid);
                }
                ids
            }
            None => Vec::new(),
        };
        drop(map);
        drop(review_map);

        tracing::info!(restaurant = %name, reviews = removed_rows, "restaurant deleted");
        if let Some(reviews) = reviews.as_ref() {
            for rid in &dropped {
                reviews.core().emit(ChangeKind::Delete, rid.to_string());
            }
        }
        self.core.emit(ChangeKind::Delete, name);
        Ok(removed_rows)
    }

    /// Looks up a restaurant by name.
    pub fn get(&self, name: &str) -> Option<Restaurant> {
        self.core.map().with_read(|m| m.get(name).cloned())
    }

    /// Looks up a restaurant by id.
    pub fn find_by_id(&self, id: RestaurantId) -> Option<Restaurant> {
        self.core
            .map()
            .with_read(|m| m.values().find(|r| r.id() == Some(id)).cloned())
    }

    /// Id of the restaurant called `name`.
    pub fn id_of(&self, name: &str) -> Option<RestaurantId> {
        self.get(name).and_then(|r| r.id())
    }

    /// Returns true if a restaurant called `name` is cached.
    pub fn contains(&self, name: &str) -> bool {
        self.core.map().with_read(|m| m.contains_key(name))
    }

    /// Snapshot of all restaurants, ordered by name.
    pub fn list(&self) -> Vec<Restaurant> {
        self.core.values()
    }

    /// Number of cached restaurants.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Returns true if no restaurants are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the map with the store's current rows.
    pub fn reload(&self) -> CoreResult<usize> {
        self.core.reload(|s| {
            Ok(s.restaurants()?
                .into_iter()
                .map(|r| (r.name().to_string(), r))
                .collect())
        })
    }

    /// Runs [`reload`](Self::reload) on the general pool.
    pub fn reload_async(self: &Arc<Self>) -> CoreResult<TaskHandle<usize>> {
        let this = Arc::clone(self);
        self.core
            .deps
            .executors
            .general()
            .spawn("reload restaurants", move || this.reload())
    }

    /// Outcome of the last reload.
    pub fn sync_status(&self) -> SyncStatus {
        self.core.status()
    }

    /// Writes a recomputed rating if it differs by more than `epsilon`.
    ///
    /// Returns false if the restaurant is not cached or the rating was
    /// already current.
    pub(crate) fn apply_rating(
        &self,
        id: RestaurantId,
        rating: f64,
        epsilon: f64,
    ) -> CoreResult<bool> {
        let mut map = self.core.write();
        let Some(current) = map.values().find(|r| r.id() == Some(id)).cloned() else {
            return Ok(false);
        };
        if (current.rating() - rating).abs() <= epsilon {
            return Ok(false);
        }

        let mut next = current;
        next.set_rating(rating);
        self.core.in_transaction(|tx| tx.update_restaurant(&next))?;
        let name = next.name().to_string();
        tracing::debug!(restaurant = %name, rating = next.rating(), "rating updated");
        map.insert(name.clone(), next);
        drop(map);

        self.core.emit(ChangeKind::Update { previous_key: None }, name);
        Ok(true)
    }
}

impl std::fmt::Debug for RestaurantCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestaurantCache")
            .field("len", &self.len())
            .field("status", &self.sync_status())
            .finish()
    }
}
