//! Review cache keyed by review id.

use super::base::{CacheCore, SyncStatus};
use super::restaurant::RestaurantCache;
use super::{on_constraint, CacheDeps};
use crate::change_feed::{ChangeKind, EntityKind};
use crate::concurrency::{LockRank, TaskHandle};
use crate::consistency::{mean_rating, RatingSync};
use crate::error::{CoreError, CoreResult};
use bistro_store::{Rating, RestaurantId, Review, ReviewId};
use std::sync::Arc;

/// Write-through cache of reviews.
///
/// Reviews reference their restaurant by id only; the restaurant name is
/// resolved through the [`RestaurantCache`] when needed. Every mutation
/// that completes is followed by a rating recompute for the owning
/// restaurant, after the review lock has been released.
pub struct ReviewCache {
    core: CacheCore<ReviewId, Review>,
    restaurants: Arc<RestaurantCache>,
    ratings: Arc<RatingSync>,
}

impl ReviewCache {
    /// Creates an empty cache.
    pub fn new(
        deps: CacheDeps,
        restaurants: Arc<RestaurantCache>,
        ratings: Arc<RatingSync>,
    ) -> Self {
        Self {
            core: CacheCore::new(EntityKind::Review, LockRank::Review, deps),
            restaurants,
            ratings,
        }
    }

    pub(crate) fn core(&self) -> &CacheCore<ReviewId, Review> {
        &self.core
    }

    fn resolve(&self, restaurant: &str) -> CoreResult<RestaurantId> {
        self.restaurants
            .id_of(restaurant)
            .ok_or_else(|| CoreError::not_found(EntityKind::Restaurant, restaurant))
    }

    /// Recomputes the owner's rating. Failures are logged and sent to the
    /// error sink; the review mutation itself has already committed.
    fn after_mutation(&self, restaurant: RestaurantId) {
        if let Err(e) = self.ratings.recompute(self, restaurant) {
            tracing::warn!(%restaurant, error = %e, "rating recompute failed");
            self.core
                .deps
                .executors
                .errors()
                .report("rating recompute", format!("restaurant {restaurant}: {e}"));
        }
    }

    /// Adds a review for the restaurant called `restaurant`.
    ///
    /// Fails with [`CoreError::NotFound`] if the restaurant does not exist.
    pub fn add(&self, restaurant: &str, rating: Rating, comment: &str) -> CoreResult<Review> {
        let restaurant_id = self.resolve(restaurant)?;
        let mut review = Review::new(restaurant_id, rating, comment);

        let mut map = self.core.write();
        let id = self
            .core
            .in_transaction(|tx| tx.insert_review(&review))
            .map_err(|e| {
                on_constraint(e, || CoreError::not_found(EntityKind::Restaurant, restaurant))
            })?;
        review.assign_id(id);
        map.insert(id, review.clone());
        drop(map);

        tracing::info!(%restaurant, review = %id, rating = %rating, "review added");
        self.core.emit(ChangeKind::Insert, id.to_string());
        self.after_mutation(restaurant_id);
        Ok(review)
    }

    /// Edits the rating and/or comment of a review.
    pub fn update(
        &self,
        id: ReviewId,
        rating: Option<Rating>,
        comment: Option<&str>,
    ) -> CoreResult<Review> {
        let mut map = self.core.write();
        let mut review = self
            .core
            .query(|s| s.review_by_id(id))?
            .ok_or_else(|| CoreError::not_found(EntityKind::Review, id))?;

        if !review.edit(rating, comment) {
            return Ok(review);
        }
        self.core.in_transaction(|tx| tx.update_review(&review))?;
        map.insert(id, review.clone());
        drop(map);

        tracing::info!(review = %id, "review updated");
        self.core.emit(ChangeKind::Update { previous_key: None }, id.to_string());
        self.after_mutation(review.restaurant_id());
        Ok(review)
    }

    /// Deletes a review.
    pub fn delete(&self, id: ReviewId) -> CoreResult<()> {
        let mut map = self.core.write();
        let restaurant_id = map
            .get(&id)
            .ok_or_else(|| CoreError::not_found(EntityKind::Review, id))?
            .restaurant_id();

        let existed = self.core.in_transaction(|tx| tx.delete_review(id))?;
        if !existed {
            tracing::warn!(review = %id, "review row was already gone from the store");
        }
        map.remove(&id);
        drop(map);

        tracing::info!(review = %id, "review deleted");
        self.core.emit(ChangeKind::Delete, id.to_string());
        self.after_mutation(restaurant_id);
        Ok(())
    }

    /// Looks up a review by id.
    pub fn get(&self, id: ReviewId) -> Option<Review> {
        self.core.map().with_read(|m| m.get(&id).cloned())
    }

    /// Snapshot of all reviews, ordered by id.
    pub fn list(&self) -> Vec<Review> {
        self.core.values()
    }

    /// Number of cached reviews.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Returns true if no reviews are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reviews of the restaurant called `name`. Empty if it is unknown.
    pub fn for_restaurant(&self, name: &str) -> Vec<Review> {
        match self.restaurants.id_of(name) {
            Some(id) => self.for_restaurant_id(id),
            None => Vec::new(),
        }
    }

    /// Reviews of the restaurant with `id`.
    pub fn for_restaurant_id(&self, id: RestaurantId) -> Vec<Review> {
        self.core.map().with_read(|m| {
            m.values()
                .filter(|r| r.restaurant_id() == id)
                .cloned()
                .collect()
        })
    }

    /// Mean rating of the restaurant's reviews, `0.0` if it has none.
    pub fn average_rating(&self, name: &str) -> CoreResult<f64> {
        let id = self.resolve(name)?;
        Ok(mean_rating(
            self.for_restaurant_id(id).iter().map(Review::rating),
        ))
    }

    /// Display name of the review's restaurant.
    pub fn restaurant_name(&self, review: &Review) -> Option<String> {
        self.restaurants
            .find_by_id(review.restaurant_id())
            .map(|r| r.name().to_string())
    }

    /// Replaces the map with the store's current rows.
    pub fn reload(&self) -> CoreResult<usize> {
        self.core.reload(|s| {
            Ok(s.reviews()?
                .into_iter()
                .filter_map(|r| r.id().map(|id| (id, r)))
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
            .spawn("reload reviews", move || this.reload())
    }

    /// Outcome of the last reload.
    pub fn sync_status(&self) -> SyncStatus {
        self.core.status()
    }
}

impl std::fmt::Debug for ReviewCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewCache")
            .field("len", &self.len())
            .field("status", &self.sync_status())
            .finish()
    }
}
