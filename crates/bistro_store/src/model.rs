//! Domain entities stored in the relational tables.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest rating a review can carry.
pub const MAX_RATING: u8 = 5;

/// Identifier of a restaurant row, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestaurantId(i64);

impl RestaurantId {
    /// Creates an id from a raw value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RestaurantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a review row, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewId(i64);

impl ReviewId {
    /// Creates an id from a raw value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ReviewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A review score in `1..=5`.
///
/// Out-of-range values are rejected when the rating is built, so a
/// `Rating` held anywhere in the system is always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rating(u8);

impl Rating {
    /// Validates and wraps a rating.
    pub fn new(value: i64) -> Result<Self, ValidationError> {
        if (1..=i64::from(MAX_RATING)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(ValidationError::RatingOutOfRange(value))
        }
    }

    /// Returns the score.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rating {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Rating> for i64 {
    fn from(rating: Rating) -> Self {
        i64::from(rating.0)
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn non_blank(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::Blank { field })
    } else {
        Ok(trimmed.to_string())
    }
}

/// A restaurant row.
///
/// `rating` is derived data: the mean of the restaurant's review ratings,
/// or `0.0` when it has none.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Restaurant {
    id: Option<RestaurantId>,
    name: String,
    location: String,
    rating: f64,
}

impl Restaurant {
    /// Creates an unsaved restaurant. Name and location are trimmed.
    pub fn new(name: &str, location: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            id: None,
            name: non_blank("name", name)?,
            location: non_blank("location", location)?,
            rating: 0.0,
        })
    }

    /// Rebuilds a restaurant from a stored row.
    pub fn from_stored(
        id: RestaurantId,
        name: String,
        location: String,
        rating: f64,
    ) -> Result<Self, ValidationError> {
        let mut restaurant = Self::new(&name, &location)?;
        restaurant.id = Some(id);
        restaurant.set_rating(rating);
        Ok(restaurant)
    }

    /// Store-assigned id, if saved.
    pub fn id(&self) -> Option<RestaurantId> {
        self.id
    }

    /// Unique display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-text location.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Average review rating.
    pub fn rating(&self) -> f64 {
        self.rating
    }

    /// Changes the name.
    pub fn rename(&mut self, name: &str) -> Result<(), ValidationError> {
        self.name = non_blank("name", name)?;
        Ok(())
    }

    /// Changes the location.
    pub fn relocate(&mut self, location: &str) -> Result<(), ValidationError> {
        self.location = non_blank("location", location)?;
        Ok(())
    }

    /// Sets the derived rating, clamped to `[0, 5]`.
    pub fn set_rating(&mut self, rating: f64) {
        self.rating = if rating.is_nan() {
            0.0
        } else {
            rating.clamp(0.0, f64::from(MAX_RATING))
        };
    }

    /// Records the id assigned by the store on insert.
    pub fn assign_id(&mut self, id: RestaurantId) {
        self.id = Some(id);
    }
}

/// A review row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Review {
    id: Option<ReviewId>,
    restaurant_id: RestaurantId,
    rating: Rating,
    comment: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl Review {
    /// Creates an unsaved review. The comment is trimmed and may be empty.
    pub fn new(restaurant_id: RestaurantId, rating: Rating, comment: &str) -> Self {
        Self {
            id: None,
            restaurant_id,
            rating,
            comment: comment.trim().to_string(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    /// Rebuilds a review from a stored row.
    pub fn from_stored(
        id: ReviewId,
        restaurant_id: RestaurantId,
        rating: Rating,
        comment: String,
        created_at: DateTime<Utc>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Some(id),
            restaurant_id,
            rating,
            comment,
            created_at,
            updated_at,
        }
    }

    /// Store-assigned id, if saved.
    pub fn id(&self) -> Option<ReviewId> {
        self.id
    }

    /// The reviewed restaurant.
    pub fn restaurant_id(&self) -> RestaurantId {
        self.restaurant_id
    }

    /// Score in `1..=5`.
    pub fn rating(&self) -> Rating {
        self.rating
    }

    /// Free-text comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time of the last edit, if any.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Applies an edit. Returns false if nothing changed.
    pub fn edit(&mut self, rating: Option<Rating>, comment: Option<&str>) -> bool {
        let mut changed = false;
        if let Some(rating) = rating {
            changed |= rating != self.rating;
            self.rating = rating;
        }
        if let Some(comment) = comment {
            let comment = comment.trim();
            changed |= comment != self.comment;
            self.comment = comment.to_string();
        }
        if changed {
            self.updated_at = Some(Utc::now());
        }
        changed
    }

    /// Records the id assigned by the store on insert.
    pub fn assign_id(&mut self, id: ReviewId) {
        self.id = Some(id);
    }
}
