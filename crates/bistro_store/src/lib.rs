//! # Bistro Store
//!
//! Domain model and relational persistence backends for Bistro.
//!
//! This crate is the system of record behind the Bistro caches. It knows
//! nothing about caching, locking or backups; it only exposes the two
//! relational tables (`restaurants`, `reviews`) through a small set of
//! primitives: connect, ping, transactions, query, save and delete.
//!
//! ## Design Principles
//!
//! - Backends are `Send + Sync` factories of sessions
//! - Sessions are single-owner connections (`Send`, not `Sync`)
//! - `reviews.restaurant_id` references `restaurants.id` with cascade delete
//! - Reviews reference their restaurant by id only; names are looked up
//!
//! ## Available Backends
//!
//! - [`MemoryBackend`] - In-process relational tables for tests and ephemeral use
//! - [`SqliteBackend`] - Persistent storage through `rusqlite`
//!
//! ## Example
//!
//! ```rust
//! use bistro_store::{transaction, MemoryBackend, Restaurant, StoreBackend, StoreError};
//!
//! let backend = MemoryBackend::new();
//! let mut session = backend.connect().unwrap();
//! let id = transaction(session.as_mut(), |s| -> Result<_, StoreError> {
//!     s.insert_restaurant(&Restaurant::new("Cafe X", "Downtown")?)
//! })
//! .unwrap();
//! assert_eq!(session.restaurant_by_id(id).unwrap().unwrap().name(), "Cafe X");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;
mod model;
mod sqlite;

pub use backend::{transaction, StoreBackend, StoreSession, Table};
pub use error::{StoreError, StoreResult, ValidationError};
pub use memory::{MemoryBackend, Tables};
pub use model::{Rating, Restaurant, RestaurantId, Review, ReviewId, MAX_RATING};
pub use sqlite::{SqliteBackend, SCHEMA_SQL};
