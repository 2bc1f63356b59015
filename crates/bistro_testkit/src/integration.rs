//! Cross-crate integration test helpers.
//!
//! [`IntegrationHarness`] applies [`CacheOp`]s to a live context and to a plain
//! reference model side by side, then checks that the caches, the store
//! and the model agree.

use crate::fixtures::TestContext;
use crate::generators::CacheOp;
use bistro_core::{mean_rating, CoreError};
use bistro_store::{Rating, Restaurant, ReviewId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
struct ModelRestaurant {
    location: String,
    reviews: Vec<(ReviewId, Rating)>,
}

/// A test harness checking caches against a reference model.
pub struct IntegrationHarness {
    /// The context under test.
    pub t: TestContext,
    model: BTreeMap<String, ModelRestaurant>,
    rejected: usize,
}

impl IntegrationHarness {
    /// Creates a harness over a fresh context.
    pub fn new() -> Self {
        Self {
            t: TestContext::new(),
            model: BTreeMap::new(),
            rejected: 0,
        }
    }

    /// Operations refused with an expected domain error.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    fn expect_rejection(&mut self, result: Result<(), CoreError>, expected: bool) {
        match result {
            Ok(()) => assert!(!expected, "operation should have been rejected"),
            Err(e) => {
                assert!(expected, "unexpected failure: {e}");
                assert!(e.is_user_correctable(), "unexpected error kind: {e}");
                self.rejected += 1;
            }
        }
    }

    fn pick(&self, restaurant: &str, index: usize) -> Option<ReviewId> {
        let reviews = &self.model.get(restaurant)?.reviews;
        (!reviews.is_empty()).then(|| reviews[index % reviews.len()].0)
    }

    /// Applies one operation to both sides.
    pub fn apply(&mut self, op: &CacheOp) {
        let caches = self.t.caches().clone();
        match op {
            CacheOp::AddRestaurant { name, location } => {
                let taken = self.model.contains_key(name);
                let result = caches
                    .restaurants
                    .add(Restaurant::new(name, location).expect("Invalid restaurant"))
                    .map(drop);
                self.expect_rejection(result, taken);
                if !taken {
                    self.model.insert(
                        name.clone(),
                        ModelRestaurant {
                            location: location.clone(),
                            reviews: Vec::new(),
                        },
                    );
                }
            }
            CacheOp::Relocate { name, location } => {
                let Some(mut current) = caches.restaurants.get(name) else {
                    assert!(!self.model.contains_key(name));
                    return;
                };
                current.relocate(location).expect("Invalid location");
                caches.restaurants.update(&current).expect("Failed to relocate");
                if let Some(entry) = self.model.get_mut(name) {
                    entry.location = location.clone();
                }
            }
            CacheOp::Rename { from, to } => {
                let Some(mut current) = caches.restaurants.get(from) else {
                    assert!(!self.model.contains_key(from));
                    return;
                };
                let collides = from != to && self.model.contains_key(to);
                current.rename(to).expect("Invalid name");
                let result = caches.restaurants.update(&current).map(drop);
                self.expect_rejection(result, collides);
                if !collides {
                    if let Some(entry) = self.model.remove(from) {
                        self.model.insert(to.clone(), entry);
                    }
                }
            }
            CacheOp::DeleteRestaurant { name } => {
                let exists = self.model.contains_key(name);
                let result = caches.restaurants.delete(name).map(drop);
                self.expect_rejection(result, !exists);
                self.model.remove(name);
            }
            CacheOp::AddReview {
                restaurant,
                rating,
                comment,
            } => {
                let exists = self.model.contains_key(restaurant);
                match caches.reviews.add(restaurant, *rating, comment) {
                    Ok(review) => {
                        assert!(exists);
                        let id = review.id().expect("Saved review has an id");
                        if let Some(entry) = self.model.get_mut(restaurant) {
                            entry.reviews.push((id, *rating));
                        }
                    }
                    Err(e) => self.expect_rejection(Err(e), !exists),
                }
            }
            CacheOp::EditReview {
                restaurant,
                index,
                rating,
            } => {
                let Some(id) = self.pick(restaurant, *index) else {
                    return;
                };
                caches
                    .reviews
                    .update(id, Some(*rating), None)
                    .expect("Failed to edit review");
                if let Some(entry) = self.model.get_mut(restaurant) {
                    for r in &mut entry.reviews {
                        if r.0 == id {
                            r.1 = *rating;
                        }
                    }
                }
            }
            CacheOp::DeleteReview { restaurant, index } => {
                let Some(id) = self.pick(restaurant, *index) else {
                    return;
                };
                caches.reviews.delete(id).expect("Failed to delete review");
                if let Some(entry) = self.model.get_mut(restaurant) {
                    entry.reviews.retain(|r| r.0 != id);
                }
            }
        }
    }

    /// Asserts that caches, store and model agree.
    pub fn verify(&self) {
        let caches = self.t.caches();
        let tables = self.t.backend.snapshot();

        assert_eq!(caches.restaurants.len(), self.model.len(), "restaurant count");
        assert_eq!(tables.restaurants.len(), self.model.len(), "stored restaurant count");
        let review_total: usize = self.model.values().map(|r| r.reviews.len()).sum();
        assert_eq!(caches.reviews.len(), review_total, "review count");
        assert_eq!(tables.reviews.len(), review_total, "stored review count");

        for (name, expected) in &self.model {
            let cached = caches
                .restaurants
                .get(name)
                .unwrap_or_else(|| panic!("{name} missing from cache"));
            let id = cached.id().expect("Cached restaurant has an id");
            let stored = &tables.restaurants[&id];
            assert_eq!(cached.name(), stored.name());
            assert_eq!(cached.location(), expected.location);
            assert_eq!(stored.location(), expected.location);

            let mean = mean_rating(expected.reviews.iter().map(|r| r.1));
            assert!(
                (cached.rating() - mean).abs() < 1e-9,
                "{name}: cached rating {} != {mean}",
                cached.rating()
            );
            assert!(
                (stored.rating() - mean).abs() < 1e-9,
                "{name}: stored rating {} != {mean}",
                stored.rating()
            );
            assert_eq!(caches.reviews.for_restaurant(name).len(), expected.reviews.len());
        }

        for review in caches.reviews.list() {
            assert!(
                caches.restaurants.find_by_id(review.restaurant_id()).is_some(),
                "review {:?} has no restaurant",
                review.id()
            );
        }
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}
