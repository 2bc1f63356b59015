//! In-memory relational backend for testing.

use crate::backend::{StoreBackend, StoreSession, Table};
use crate::error::{StoreError, StoreResult};
use crate::model::{Restaurant, RestaurantId, Review, ReviewId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The raw contents of a [`MemoryBackend`].
///
/// Sequences hold the last id handed out per table, mirroring SQL identity
/// sequences: they survive truncation and only move forward unless
/// explicitly repaired.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    /// `restaurants` rows by id.
    pub restaurants: BTreeMap<RestaurantId, Restaurant>,
    /// `reviews` rows by id.
    pub reviews: BTreeMap<ReviewId, Review>,
    /// Last id issued for `restaurants`.
    pub restaurant_seq: i64,
    /// Last id issued for `reviews`.
    pub review_seq: i64,
}

impl Tables {
    fn restaurant_named(&self, name: &str) -> Option<&Restaurant> {
        self.restaurants.values().find(|r| r.name() == name)
    }
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    failing_connects: usize,
    failing_writes: usize,
    query_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: RwLock<Tables>,
    faults: Mutex<Faults>,
    open_sessions: AtomicUsize,
    epoch: AtomicU64,
}

/// An in-memory store with the same relational rules as the SQL schema.
///
/// Enforces the unique restaurant name, the review to restaurant foreign
/// key and cascade deletes. Cloning yields another handle to the same
/// tables.
///
/// Besides the store primitives it exposes fault-injection hooks so tests
/// can simulate outages, failing writes and slow queries.
///
/// # Example
///
/// ```rust
/// use bistro_store::{MemoryBackend, StoreBackend, Table};
///
/// let backend = MemoryBackend::new();
/// let mut session = backend.connect().unwrap();
/// assert_eq!(session.count(Table::Restaurants).unwrap(), 0);
///
/// backend.set_offline(true);
/// assert!(backend.connect().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<MemoryState>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-populated with `tables`.
    #[must_use]
    pub fn with_tables(tables: Tables) -> Self {
        let backend = Self::new();
        backend.replace(tables);
        backend
    }

    /// Returns a copy of all rows and sequences.
    #[must_use]
    pub fn snapshot(&self) -> Tables {
        self.state.tables.read().clone()
    }

    /// Replaces all rows and sequences.
    pub fn replace(&self, tables: Tables) {
        *self.state.tables.write() = tables;
    }

    /// Empties both tables. Sequences are left untouched.
    pub fn truncate(&self) {
        let mut tables = self.state.tables.write();
        tables.reviews.clear();
        tables.restaurants.clear();
    }

    /// Resets each sequence to the highest id present (or 1 if empty).
    pub fn repair_sequences(&self) {
        let mut tables = self.state.tables.write();
        tables.restaurant_seq = tables
            .restaurants
            .keys()
            .next_back()
            .map_or(1, |id| id.get());
        tables.review_seq = tables.reviews.keys().next_back().map_or(1, |id| id.get());
    }

    /// Simulates the server going away. Existing sessions fail too.
    pub fn set_offline(&self, offline: bool) {
        self.state.faults.lock().offline = offline;
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.faults.lock().failing_connects = n;
    }

    /// Makes the next `n` write statements fail with a connection error.
    pub fn fail_next_writes(&self, n: usize) {
        self.state.faults.lock().failing_writes = n;
    }

    /// Delays every query and write by `delay`.
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        self.state.faults.lock().query_delay = delay;
    }

    /// Invalidates every live session, like a server-side backend kill.
    ///
    /// Returns how many sessions were open.
    pub fn terminate_sessions(&self) -> usize {
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
        self.open_sessions()
    }

    /// Number of sessions not yet dropped.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }
}

impl StoreBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn connect(&self) -> StoreResult<Box<dyn StoreSession>> {
        {
            let mut faults = self.state.faults.lock();
            if faults.offline {
                return Err(StoreError::Unavailable("memory store is offline".into()));
            }
            if faults.failing_connects > 0 {
                faults.failing_connects -= 1;
                return Err(StoreError::Unavailable("injected connect failure".into()));
            }
        }
        self.state.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            epoch: self.state.epoch.load(Ordering::SeqCst),
            undo: None,
        }))
    }
}

enum Undo {
    RestaurantInserted(RestaurantId),
    RestaurantReplaced(Restaurant),
    RestaurantRemoved(Restaurant),
    ReviewInserted(ReviewId),
    ReviewReplaced(Review),
    ReviewRemoved(Review),
}

struct MemorySession {
    state: Arc<MemoryState>,
    epoch: u64,
    undo: Option<Vec<Undo>>,
}

impl MemorySession {
    fn check_live(&self) -> StoreResult<()> {
        let delay = {
            let faults = self.state.faults.lock();
            if faults.offline {
                return Err(StoreError::Unavailable("memory store is offline".into()));
            }
            faults.query_delay
        };
        if self.epoch != self.state.epoch.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "session terminated by administrator".into(),
            ));
        }
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn check_write(&self) -> StoreResult<()> {
        self.check_live()?;
        let mut faults = self.state.faults.lock();
        if faults.failing_writes > 0 {
            faults.failing_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn record(&mut self, entry: Undo) {
        if let Some(log) = self.undo.as_mut() {
            log.push(entry);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.undo.is_some() {
            let _ = self.rollback();
        }
        self.state.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StoreSession for MemorySession {
    fn ping(&mut self) -> StoreResult<()> {
        self.check_live()
    }

    fn begin(&mut self) -> StoreResult<()> {
        self.check_live()?;
        if self.undo.is_some() {
            return Err(StoreError::TransactionState(
                "transaction already active".into(),
            ));
        }
        self.undo = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.check_live()?;
        match self.undo.take() {
            Some(_) => Ok(()),
            None => Err(StoreError::TransactionState("no active transaction".into())),
        }
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let Some(log) = self.undo.take() else {
            return Err(StoreError::TransactionState("no active transaction".into()));
        };
        let mut tables = self.state.tables.write();
        for entry in log.into_iter().rev() {
            match entry {
                Undo::RestaurantInserted(id) => {
                    tables.restaurants.remove(&id);
                }
                Undo::RestaurantReplaced(old) | Undo::RestaurantRemoved(old) => {
                    if let Some(id) = old.id() {
                        tables.restaurants.insert(id, old);
                    }
                }
                Undo::ReviewInserted(id) => {
                    tables.reviews.remove(&id);
                }
                Undo::ReviewReplaced(old) | Undo::ReviewRemoved(old) => {
                    if let Some(id) = old.id() {
                        tables.reviews.insert(id, old);
                    }
                }
            }
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.undo.is_some()
    }

    fn restaurants(&mut self) -> StoreResult<Vec<Restaurant>> {
        self.check_live()?;
        let mut all: Vec<Restaurant> =
            self.state.tables.read().restaurants.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(all)
    }

    fn restaurant_by_id(&mut self, id: RestaurantId) -> StoreResult<Option<Restaurant>> {
        self.check_live()?;
        Ok(self.state.tables.read().restaurants.get(&id).cloned())
    }

    fn restaurant_by_name(&mut self, name: &str) -> StoreResult<Option<Restaurant>> {
        self.check_live()?;
        Ok(self.state.tables.read().restaurant_named(name).cloned())
    }

    fn insert_restaurant(&mut self, restaurant: &Restaurant) -> StoreResult<RestaurantId> {
        self.check_write()?;
        let id = {
            let mut tables = self.state.tables.write();
            if tables.restaurant_named(restaurant.name()).is_some() {
                return Err(StoreError::Constraint(format!(
                    "duplicate restaurant name '{}'",
                    restaurant.name()
                )));
            }
            tables.restaurant_seq += 1;
            let id = RestaurantId::new(tables.restaurant_seq);
            let mut row = restaurant.clone();
            row.assign_id(id);
            tables.restaurants.insert(id, row);
            id
        };
        self.record(Undo::RestaurantInserted(id));
        Ok(id)
    }

    fn update_restaurant(&mut self, restaurant: &Restaurant) -> StoreResult<()> {
        self.check_write()?;
        let id = restaurant.id().ok_or(StoreError::MissingId {
            table: Table::Restaurants,
        })?;
        let old = {
            let mut tables = self.state.tables.write();
            if let Some(other) = tables.restaurant_named(restaurant.name()) {
                if other.id() != Some(id) {
                    return Err(StoreError::Constraint(format!(
                        "duplicate restaurant name '{}'",
                        restaurant.name()
                    )));
                }
            }
            let Some(slot) = tables.restaurants.get_mut(&id) else {
                return Err(StoreError::RowNotFound {
                    table: Table::Restaurants,
                    id: id.get(),
                });
            };
            std::mem::replace(slot, restaurant.clone())
        };
        self.record(Undo::RestaurantReplaced(old));
        Ok(())
    }

    fn delete_restaurant(&mut self, id: RestaurantId) -> StoreResult<bool> {
        self.check_write()?;
        let (removed, cascaded) = {
            let mut tables = self.state.tables.write();
            let Some(removed) = tables.restaurants.remove(&id) else {
                return Ok(false);
            };
            let doomed: Vec<ReviewId> = tables
                .reviews
                .iter()
                .filter(|(_, r)| r.restaurant_id() == id)
                .map(|(rid, _)| *rid)
                .collect();
            let cascaded: Vec<Review> = doomed
                .iter()
                .filter_map(|rid| tables.reviews.remove(rid))
                .collect();
            (removed, cascaded)
        };
        for review in cascaded {
            self.record(Undo::ReviewRemoved(review));
        }
        self.record(Undo::RestaurantRemoved(removed));
        Ok(true)
    }

    fn reviews(&mut self) -> StoreResult<Vec<Review>> {
        self.check_live()?;
        Ok(self.state.tables.read().reviews.values().cloned().collect())
    }

    fn review_by_id(&mut self, id: ReviewId) -> StoreResult<Option<Review>> {
        self.check_live()?;
        Ok(self.state.tables.read().reviews.get(&id).cloned())
    }

    fn insert_review(&mut self, review: &Review) -> StoreResult<ReviewId> {
        self.check_write()?;
        let id = {
            let mut tables = self.state.tables.write();
            if !tables.restaurants.contains_key(&review.restaurant_id()) {
                return Err(StoreError::Constraint(format!(
                    "restaurant {} does not exist",
                    review.restaurant_id()
                )));
            }
            tables.review_seq += 1;
            let id = ReviewId::new(tables.review_seq);
            let mut row = review.clone();
            row.assign_id(id);
            tables.reviews.insert(id, row);
            id
        };
        self.record(Undo::ReviewInserted(id));
        Ok(id)
    }

    fn update_review(&mut self, review: &Review) -> StoreResult<()> {
        self.check_write()?;
        let id = review.id().ok_or(StoreError::MissingId {
            table: Table::Reviews,
        })?;
        let old = {
            let mut tables = self.state.tables.write();
            if !tables.restaurants.contains_key(&review.restaurant_id()) {
                return Err(StoreError::Constraint(format!(
                    "restaurant {} does not exist",
                    review.restaurant_id()
                )));
            }
            let Some(slot) = tables.reviews.get_mut(&id) else {
                return Err(StoreError::RowNotFound {
                    table: Table::Reviews,
                    id: id.get(),
                });
            };
            std::mem::replace(slot, review.clone())
        };
        self.record(Undo::ReviewReplaced(old));
        Ok(())
    }

    fn delete_review(&mut self, id: ReviewId) -> StoreResult<bool> {
        self.check_write()?;
        let removed = self.state.tables.write().reviews.remove(&id);
        match removed {
            Some(review) => {
                self.record(Undo::ReviewRemoved(review));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_reviews_for(&mut self, restaurant: RestaurantId) -> StoreResult<usize> {
        self.check_write()?;
        let removed: Vec<Review> = {
            let mut tables = self.state.tables.write();
            let doomed: Vec<ReviewId> = tables
                .reviews
                .iter()
                .filter(|(_, r)| r.restaurant_id() == restaurant)
                .map(|(id, _)| *id)
                .collect();
            doomed
                .iter()
                .filter_map(|id| tables.reviews.remove(id))
                .collect()
        };
        let count = removed.len();
        for review in removed {
            self.record(Undo::ReviewRemoved(review));
        }
        Ok(count)
    }

    fn count(&mut self, table: Table) -> StoreResult<u64> {
        self.check_live()?;
        let tables = self.state.tables.read();
        Ok(match table {
            Table::Restaurants => tables.restaurants.len() as u64,
            Table::Reviews => tables.reviews.len() as u64,
        })
    }
}
