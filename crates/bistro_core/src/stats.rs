//! Aggregate figures over the cached data.

use crate::cache::CacheSet;
use crate::consistency::mean_rating;
use bistro_store::{Rating, RestaurantId, Review};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Counts and rating figures across all restaurants and reviews.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    /// Cached restaurants.
    pub restaurant_count: usize,
    /// Cached reviews.
    pub review_count: usize,
    /// Mean of every review's rating, 0.0 without reviews.
    pub average_rating: f64,
    /// Lowest review rating.
    pub lowest_rating: Option<Rating>,
    /// Highest review rating.
    pub highest_rating: Option<Rating>,
    /// Review count per restaurant location. Locations whose restaurants
    /// have no reviews are listed with 0.
    pub reviews_by_location: BTreeMap<String, usize>,
}

impl Statistics {
    /// Computes the figures from one consistent view of both caches.
    pub fn collect(caches: &CacheSet) -> Self {
        let reviews = caches.reviews.core().map().read();
        let restaurants = caches.restaurants.core().map().read();

        let mut per_restaurant: HashMap<RestaurantId, usize> = HashMap::new();
        for review in reviews.values() {
            *per_restaurant.entry(review.restaurant_id()).or_default() += 1;
        }
        let mut reviews_by_location = BTreeMap::new();
        for restaurant in restaurants.values() {
            let location = restaurant.location().trim();
            if location.is_empty() {
                continue;
            }
            let count = restaurant
                .id()
                .and_then(|id| per_restaurant.get(&id))
                .copied()
                .unwrap_or(0);
            *reviews_by_location.entry(location.to_string()).or_default() += count;
        }

        let ratings: Vec<Rating> = reviews.values().map(Review::rating).collect();
        Self {
            restaurant_count: restaurants.len(),
            review_count: ratings.len(),
            average_rating: mean_rating(ratings.iter().copied()),
            lowest_rating: ratings.iter().min().copied(),
            highest_rating: ratings.iter().max().copied(),
            reviews_by_location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::SqliteDialect;
    use crate::{AppContext, Config};
    use bistro_store::{MemoryBackend, Restaurant};
    use std::sync::Arc;

    fn context() -> Arc<AppContext> {
        let ctx = AppContext::builder(
            Arc::new(MemoryBackend::new()),
            Arc::new(SqliteDialect::new("unused.db")),
        )
        .config(Config::fast())
        .build()
        .unwrap();
        ctx.open().unwrap();
        ctx
    }

    #[test]
    fn empty_caches_report_zeroes() {
        let stats = context().statistics();
        assert_eq!(stats.restaurant_count, 0);
        assert_eq!(stats.review_count, 0);
        assert_eq!(stats.average_rating, 0.0);
        assert_eq!(stats.lowest_rating, None);
        assert!(stats.reviews_by_location.is_empty());
    }

    #[test]
    fn locations_sum_reviews_of_their_restaurants() {
        let ctx = context();
        for (name, location) in [("A", "Downtown"), ("B", "Downtown"), ("C", "Harbour")] {
            ctx.restaurants()
                .add(Restaurant::new(name, location).unwrap())
                .unwrap();
        }
        for (name, rating) in [("A", 5), ("A", 2), ("B", 4)] {
            ctx.reviews()
                .add(name, Rating::new(rating).unwrap(), "")
                .unwrap();
        }

        let stats = ctx.statistics();
        assert_eq!(stats.restaurant_count, 3);
        assert_eq!(stats.review_count, 3);
        assert!((stats.average_rating - 11.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.lowest_rating.map(Rating::get), Some(2));
        assert_eq!(stats.highest_rating.map(Rating::get), Some(5));
        assert_eq!(stats.reviews_by_location["Downtown"], 3);
        assert_eq!(stats.reviews_by_location["Harbour"], 0);
    }
}
