//! SQLite backend.

use crate::backend::{StoreBackend, StoreSession, Table};
use crate::error::{StoreError, StoreResult, ValidationError};
use crate::model::{Rating, Restaurant, RestaurantId, Review, ReviewId};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Schema applied on every connect. Idempotent.
pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS restaurants (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    name     TEXT    NOT NULL UNIQUE,
    location TEXT    NOT NULL,
    rating   REAL    NOT NULL DEFAULT 0.0
);
CREATE TABLE IF NOT EXISTS reviews (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    restaurant_id INTEGER NOT NULL REFERENCES restaurants(id) ON DELETE CASCADE,
    rating        INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
    comment       TEXT    NOT NULL DEFAULT '',
    created_at    TEXT    NOT NULL,
    updated_at    TEXT
);
CREATE INDEX IF NOT EXISTS idx_reviews_restaurant ON reviews(restaurant_id);
";

const RESTAURANT_COLUMNS: &str = "id, name, location, rating";
const REVIEW_COLUMNS: &str = "id, restaurant_id, rating, comment, created_at, updated_at";

/// A store backed by a single SQLite database file.
///
/// Each session owns its own [`Connection`]. Foreign keys are enforced and
/// writers wait up to `busy_timeout` for the file lock.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBackend {
    /// Creates a backend for the database at `path`. The file is created
    /// on first connect.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Sets how long a session waits on a locked database.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn connect(&self) -> StoreResult<Box<dyn StoreSession>> {
        let conn = Connection::open(&self.path).map_err(|e| {
            StoreError::Unavailable(format!("cannot open {}: {e}", self.path.display()))
        })?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::trace!(path = %self.path.display(), "sqlite session opened");
        Ok(Box::new(SqliteSession { conn }))
    }
}

struct SqliteSession {
    conn: Connection,
}

fn invalid(column: usize, err: ValidationError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn restaurant_from_row(row: &Row<'_>) -> rusqlite::Result<Restaurant> {
    Restaurant::from_stored(
        RestaurantId::new(row.get(0)?),
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
    )
    .map_err(|e| invalid(1, e))
}

fn review_from_row(row: &Row<'_>) -> rusqlite::Result<Review> {
    let rating = Rating::new(row.get(2)?).map_err(|e| invalid(2, e))?;
    Ok(Review::from_stored(
        ReviewId::new(row.get(0)?),
        RestaurantId::new(row.get(1)?),
        rating,
        row.get(3)?,
        row.get::<_, DateTime<Utc>>(4)?,
        row.get::<_, Option<DateTime<Utc>>>(5)?,
    ))
}

impl StoreSession for SqliteSession {
    fn ping(&mut self) -> StoreResult<()> {
        self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn begin(&mut self) -> StoreResult<()> {
        if self.in_transaction() {
            return Err(StoreError::TransactionState(
                "transaction already active".into(),
            ));
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        if !self.in_transaction() {
            return Err(StoreError::TransactionState("no active transaction".into()));
        }
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if !self.in_transaction() {
            return Err(StoreError::TransactionState("no active transaction".into()));
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn restaurants(&mut self) -> StoreResult<Vec<Restaurant>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {RESTAURANT_COLUMNS} FROM restaurants ORDER BY name"
        ))?;
        let rows = stmt.query_map([], restaurant_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn restaurant_by_id(&mut self, id: RestaurantId) -> StoreResult<Option<Restaurant>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {RESTAURANT_COLUMNS} FROM restaurants WHERE id = ?1"),
                params![id.get()],
                restaurant_from_row,
            )
            .optional()?)
    }

    fn restaurant_by_name(&mut self, name: &str) -> StoreResult<Option<Restaurant>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {RESTAURANT_COLUMNS} FROM restaurants WHERE name = ?1"),
                params![name],
                restaurant_from_row,
            )
            .optional()?)
    }

    fn insert_restaurant(&mut self, restaurant: &Restaurant) -> StoreResult<RestaurantId> {
        self.conn.execute(
            "INSERT INTO restaurants (name, location, rating) VALUES (?1, ?2, ?3)",
            params![restaurant.name(), restaurant.location(), restaurant.rating()],
        )?;
        Ok(RestaurantId::new(self.conn.last_insert_rowid()))
    }

    fn update_restaurant(&mut self, restaurant: &Restaurant) -> StoreResult<()> {
        let id = restaurant.id().ok_or(StoreError::MissingId {
            table: Table::Restaurants,
        })?;
        let changed = self.conn.execute(
            "UPDATE restaurants SET name = ?1, location = ?2, rating = ?3 WHERE id = ?4",
            params![
                restaurant.name(),
                restaurant.location(),
                restaurant.rating(),
                id.get()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RowNotFound {
                table: Table::Restaurants,
                id: id.get(),
            });
        }
        Ok(())
    }

    fn delete_restaurant(&mut self, id: RestaurantId) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM restaurants WHERE id = ?1", params![id.get()])?;
        Ok(changed > 0)
    }

    fn reviews(&mut self) -> StoreResult<Vec<Review>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {REVIEW_COLUMNS} FROM reviews ORDER BY id"))?;
        let rows = stmt.query_map([], review_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn review_by_id(&mut self, id: ReviewId) -> StoreResult<Option<Review>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {REVIEW_COLUMNS} FROM reviews WHERE id = ?1"),
                params![id.get()],
                review_from_row,
            )
            .optional()?)
    }

    fn insert_review(&mut self, review: &Review) -> StoreResult<ReviewId> {
        self.conn.execute(
            "INSERT INTO reviews (restaurant_id, rating, comment, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                review.restaurant_id().get(),
                i64::from(review.rating()),
                review.comment(),
                review.created_at(),
                review.updated_at()
            ],
        )?;
        Ok(ReviewId::new(self.conn.last_insert_rowid()))
    }

    fn update_review(&mut self, review: &Review) -> StoreResult<()> {
        let id = review.id().ok_or(StoreError::MissingId {
            table: Table::Reviews,
        })?;
        let changed = self.conn.execute(
            "UPDATE reviews SET restaurant_id = ?1, rating = ?2, comment = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                review.restaurant_id().get(),
                i64::from(review.rating()),
                review.comment(),
                review.updated_at(),
                id.get()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::RowNotFound {
                table: Table::Reviews,
                id: id.get(),
            });
        }
        Ok(())
    }

    fn delete_review(&mut self, id: ReviewId) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM reviews WHERE id = ?1", params![id.get()])?;
        Ok(changed > 0)
    }

    fn delete_reviews_for(&mut self, restaurant: RestaurantId) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "DELETE FROM reviews WHERE restaurant_id = ?1",
            params![restaurant.get()],
        )?)
    }

    fn count(&mut self, table: Table) -> StoreResult<u64> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }
}
