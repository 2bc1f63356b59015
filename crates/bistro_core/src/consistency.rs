//! Keeps each restaurant's rating equal to the mean of its reviews.

use crate::cache::{RestaurantCache, ReviewCache};
use crate::concurrency::ErrorSink;
use crate::error::CoreResult;
use bistro_store::{Rating, RestaurantId};
use std::collections::HashMap;
use std::sync::Arc;

/// Arithmetic mean of `ratings`, or `0.0` when there are none.
pub fn mean_rating(ratings: impl IntoIterator<Item = Rating>) -> f64 {
    let (sum, count) = ratings
        .into_iter()
        .fold((0u64, 0u64), |(sum, n), r| (sum + u64::from(r.get()), n + 1));
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

/// Recomputes derived restaurant ratings from the review cache.
///
/// Reads reviews under the review cache's read lock and writes the
/// restaurant under the restaurant cache's write lock, always in that
/// order. Ratings within `epsilon` of the stored value are not written.
pub struct RatingSync {
    restaurants: Arc<RestaurantCache>,
    epsilon: f64,
    errors: Arc<ErrorSink>,
}

impl RatingSync {
    /// Creates a rating sync writing through `restaurants`.
    pub fn new(restaurants: Arc<RestaurantCache>, epsilon: f64, errors: Arc<ErrorSink>) -> Self {
        Self {
            restaurants,
            epsilon,
            errors,
        }
    }

    /// Recomputes one restaurant's rating.
    ///
    /// Returns the new rating if it was written, `None` if it was already
    /// current or the restaurant is no longer cached.
    pub fn recompute(
        &self,
        reviews: &ReviewCache,
        restaurant: RestaurantId,
    ) -> CoreResult<Option<f64>> {
        let guard = reviews.core().map().read();
        let mean = mean_rating(
            guard
                .values()
                .filter(|r| r.restaurant_id() == restaurant)
                .map(|r| r.rating()),
        );
        let written = self
            .restaurants
            .apply_rating(restaurant, mean, self.epsilon)?;
        drop(guard);
        Ok(written.then_some(mean))
    }

    /// Recomputes every cached restaurant's rating.
    ///
    /// Returns how many restaurants were corrected. A failure on one
    /// restaurant is reported and the pass continues; the first error is
    /// returned at the end.
    pub fn reconcile_all(&self, reviews: &ReviewCache) -> CoreResult<usize> {
        let guard = reviews.core().map().read();
        let mut by_restaurant: HashMap<RestaurantId, Vec<Rating>> = HashMap::new();
        for review in guard.values() {
            by_restaurant
                .entry(review.restaurant_id())
                .or_default()
                .push(review.rating());
        }

        let mut fixed = 0;
        let mut first_error = None;
        for restaurant in self.restaurants.list() {
            let Some(id) = restaurant.id() else {
                continue;
            };
            let mean = mean_rating(by_restaurant.remove(&id).unwrap_or_default());
            match self.restaurants.apply_rating(id, mean, self.epsilon) {
                Ok(true) => fixed += 1,
                Ok(false) => {}
                Err(e) => {
                    self.errors
                        .report("rating reconcile", format!("{}: {e}", restaurant.name()));
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(guard);

        if !by_restaurant.is_empty() {
            tracing::warn!(
                orphans = by_restaurant.len(),
                "reviews reference restaurants missing from the cache"
            );
        }
        tracing::info!(fixed, "ratings reconciled");
        match first_error {
            Some(e) => Err(e),
            None => Ok(fixed),
        }
    }
}

impl std::fmt::Debug for RatingSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatingSync")
            .field("epsilon", &self.epsilon)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ratings(values: &[i64]) -> Vec<Rating> {
        values.iter().map(|v| Rating::new(*v).unwrap()).collect()
    }

    #[test]
    fn mean_of_nothing_is_zero() {
        assert_eq!(mean_rating(Vec::new()), 0.0);
    }

    #[test]
    fn mean_of_values() {
        assert_eq!(mean_rating(ratings(&[4, 2])), 3.0);
        assert_eq!(mean_rating(ratings(&[2])), 2.0);
        assert!((mean_rating(ratings(&[5, 4, 4])) - 13.0 / 3.0).abs() < 1e-12);
    }

    proptest! {
        #[test]
        fn mean_stays_in_rating_range(values in proptest::collection::vec(1i64..=5, 1..50)) {
            let mean = mean_rating(ratings(&values));
            prop_assert!((1.0..=5.0).contains(&mean));
        }
    }
}
