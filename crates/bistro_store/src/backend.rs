//! Backend and session traits.

use crate::error::{StoreError, StoreResult};
use crate::model::{Restaurant, RestaurantId, Review, ReviewId};
use std::fmt;

/// The relational tables managed by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// The `restaurants` table.
    Restaurants,
    /// The `reviews` table.
    Reviews,
}

impl Table {
    /// SQL table name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Restaurants => "restaurants",
            Self::Reviews => "reviews",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A factory of sessions against one relational store.
///
/// Backends are shared across threads. Each call to [`connect`] yields an
/// independent session; sessions are never shared between threads at the
/// same time.
///
/// # Implementors
///
/// - [`crate::MemoryBackend`] - For testing
/// - [`crate::SqliteBackend`] - For persistent storage
///
/// [`connect`]: StoreBackend::connect
pub trait StoreBackend: Send + Sync {
    /// Human-readable backend name, used in logs.
    fn name(&self) -> &str;

    /// Opens a new session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] (or a connection-class SQLite
    /// error) if the store cannot be reached.
    fn connect(&self) -> StoreResult<Box<dyn StoreSession>>;
}

/// A single connection to the store.
///
/// All writes issued between [`begin`] and [`commit`] are atomic. Writes
/// outside a transaction are applied immediately.
///
/// [`begin`]: StoreSession::begin
/// [`commit`]: StoreSession::commit
pub trait StoreSession: Send {
    /// Issues a trivial round-trip to check the connection is alive.
    fn ping(&mut self) -> StoreResult<()>;

    /// Starts a transaction.
    fn begin(&mut self) -> StoreResult<()>;

    /// Commits the active transaction.
    fn commit(&mut self) -> StoreResult<()>;

    /// Rolls back the active transaction.
    fn rollback(&mut self) -> StoreResult<()>;

    /// Returns true while a transaction is open.
    fn in_transaction(&self) -> bool;

    /// All restaurants, ordered by name.
    fn restaurants(&mut self) -> StoreResult<Vec<Restaurant>>;

    /// Looks up a restaurant by id.
    fn restaurant_by_id(&mut self, id: RestaurantId) -> StoreResult<Option<Restaurant>>;

    /// Looks up a restaurant by its unique name.
    fn restaurant_by_name(&mut self, name: &str) -> StoreResult<Option<Restaurant>>;

    /// Inserts a restaurant and returns its new id.
    fn insert_restaurant(&mut self, restaurant: &Restaurant) -> StoreResult<RestaurantId>;

    /// Overwrites the row matching `restaurant.id()`.
    fn update_restaurant(&mut self, restaurant: &Restaurant) -> StoreResult<()>;

    /// Deletes a restaurant. Returns false if no row matched.
    fn delete_restaurant(&mut self, id: RestaurantId) -> StoreResult<bool>;

    /// All reviews, ordered by id.
    fn reviews(&mut self) -> StoreResult<Vec<Review>>;

    /// Looks up a review by id.
    fn review_by_id(&mut self, id: ReviewId) -> StoreResult<Option<Review>>;

    /// Inserts a review and returns its new id.
    fn insert_review(&mut self, review: &Review) -> StoreResult<ReviewId>;

    /// Overwrites the row matching `review.id()`.
    fn update_review(&mut self, review: &Review) -> StoreResult<()>;

    /// Deletes a review. Returns false if no row matched.
    fn delete_review(&mut self, id: ReviewId) -> StoreResult<bool>;

    /// Deletes every review of one restaurant and returns how many went.
    fn delete_reviews_for(&mut self, restaurant: RestaurantId) -> StoreResult<usize>;

    /// Row count of a table.
    fn count(&mut self, table: Table) -> StoreResult<u64>;
}

/// Runs `f` inside a transaction on `session`.
///
/// Commits if `f` succeeds. If `f` or the commit fails the transaction is
/// rolled back and the original error is returned; a failing rollback is
/// only logged.
pub fn transaction<T, E, F>(session: &mut dyn StoreSession, f: F) -> Result<T, E>
where
    E: From<StoreError>,
    F: FnOnce(&mut dyn StoreSession) -> Result<T, E>,
{
    session.begin()?;
    let result = f(session).and_then(|value| {
        session.commit()?;
        Ok(value)
    });
    if result.is_err() && session.in_transaction() {
        if let Err(e) = session.rollback() {
            tracing::warn!(error = %e, "rollback failed");
        }
    }
    result
}
