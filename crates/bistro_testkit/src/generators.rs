//! Property-based test generators using proptest.
//!
//! Provides strategies for generating restaurants, reviews and sequences
//! of cache operations that respect the domain's validation rules.

use bistro_store::{Rating, MAX_RATING};
use proptest::prelude::*;

/// Strategy for generating valid restaurant names.
///
/// Names come from a small alphabet so that generated operation sequences
/// collide on the same keys often.
pub fn restaurant_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("(Cafe|Bistro|Diner) [A-D]")
        .expect("Invalid regex")
}

/// Strategy for generating names with awkward characters.
pub fn tricky_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9 '\\-;(),.]{0,20}")
        .expect("Invalid regex")
        .prop_filter("Name must not be blank", |s| !s.trim().is_empty())
}

/// Strategy for generating valid locations.
pub fn location_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{2,10} (Street|Avenue|Square)")
        .expect("Invalid regex")
}

/// Strategy for generating valid ratings.
pub fn rating_strategy() -> impl Strategy<Value = Rating> {
    (1..=i64::from(MAX_RATING)).prop_map(|v| Rating::new(v).expect("Rating in range"))
}

/// Strategy for generating review comments, possibly empty.
pub fn comment_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z ,.!']{0,40}").expect("Invalid regex")
}

/// Strategy for generating backup labels, including characters that get
/// sanitized.
pub fn label_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 _./\\\\:*-]{1,24}")
        .expect("Invalid regex")
        .prop_filter("Label must not be blank", |s| !s.trim().is_empty())
}

/// One mutation applied through the caches.
#[derive(Debug, Clone)]
pub enum CacheOp {
    /// Add a restaurant.
    AddRestaurant {
        /// Restaurant name.
        name: String,
        /// Restaurant location.
        location: String,
    },
    /// Move a restaurant.
    Relocate {
        /// Restaurant name.
        name: String,
        /// New location.
        location: String,
    },
    /// Rename a restaurant.
    Rename {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Delete a restaurant and its reviews.
    DeleteRestaurant {
        /// Restaurant name.
        name: String,
    },
    /// Add a review.
    AddReview {
        /// Restaurant name.
        restaurant: String,
        /// Score.
        rating: Rating,
        /// Comment.
        comment: String,
    },
    /// Re-rate the n-th review of a restaurant.
    EditReview {
        /// Restaurant name.
        restaurant: String,
        /// Index into the restaurant's reviews, modulo their count.
        index: usize,
        /// New score.
        rating: Rating,
    },
    /// Delete the n-th review of a restaurant.
    DeleteReview {
        /// Restaurant name.
        restaurant: String,
        /// Index into the restaurant's reviews, modulo their count.
        index: usize,
    },
}

/// Strategy for generating cache operations.
pub fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        3 => (restaurant_name_strategy(), location_strategy())
            .prop_map(|(name, location)| CacheOp::AddRestaurant { name, location }),
        1 => (restaurant_name_strategy(), location_strategy())
            .prop_map(|(name, location)| CacheOp::Relocate { name, location }),
        1 => (restaurant_name_strategy(), restaurant_name_strategy())
            .prop_map(|(from, to)| CacheOp::Rename { from, to }),
        1 => restaurant_name_strategy().prop_map(|name| CacheOp::DeleteRestaurant { name }),
        4 => (restaurant_name_strategy(), rating_strategy(), comment_strategy())
            .prop_map(|(restaurant, rating, comment)| CacheOp::AddReview {
                restaurant,
                rating,
                comment,
            }),
        2 => (restaurant_name_strategy(), any::<usize>(), rating_strategy())
            .prop_map(|(restaurant, index, rating)| CacheOp::EditReview {
                restaurant,
                index,
                rating,
            }),
        1 => (restaurant_name_strategy(), any::<usize>())
            .prop_map(|(restaurant, index)| CacheOp::DeleteReview { restaurant, index }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn cache_op_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<CacheOp>> {
    prop::collection::vec(cache_op_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
