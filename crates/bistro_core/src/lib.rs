//! # Bistro Core
//!
//! Concurrent entity caches kept coherent with a relational store.
//!
//! This crate provides:
//! - [`PersistenceHandle`] - lifecycle of the session factory (open, close, restart, suspend)
//! - [`concurrency`] - worker pools, a scheduler, ranked read/write locks and the error sink
//! - [`RestaurantCache`] and [`ReviewCache`] - write-through caches keyed by natural key
//! - [`RatingSync`] - keeps each restaurant's rating equal to the mean of its reviews
//! - [`backup`] - dump/restore orchestration around an external tool
//! - [`snapshot`] - JSON export and import of both caches
//! - [`Statistics`] - counts and rating figures over the cached data
//! - [`AppContext`] - wires all of the above together
//!
//! ## Lock order
//!
//! The review cache lock is always taken before the restaurant cache lock.
//! Locks are ranked and violations are caught at runtime.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bistro_core::{AppContext, Config};
//! use bistro_store::{MemoryBackend, Rating, Restaurant};
//!
//! let ctx = AppContext::builder(Arc::new(MemoryBackend::new()), dialect).build()?;
//! ctx.open()?;
//! ctx.restaurants().add(Restaurant::new("Cafe X", "Downtown")?)?;
//! ctx.reviews().add("Cafe X", Rating::new(4)?, "great coffee")?;
//! assert_eq!(ctx.restaurants().get("Cafe X").unwrap().rating(), 4.0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod cache;
mod change_feed;
pub mod concurrency;
mod config;
mod consistency;
mod context;
mod error;
mod handle;
pub mod snapshot;
mod stats;

pub use backup::{
    BackupConfig, BackupFormat, BackupOrchestrator, BackupOutcome, BackupPhase, BackupReport,
    PhaseEvent, RestoreReport, RestoreRequest,
};
pub use cache::{CacheDeps, CacheSet, ReloadSummary, RestaurantCache, ReviewCache, SyncStatus};
pub use change_feed::{ChangeEvent, ChangeFeed, ChangeKind, EntityKind};
pub use config::{Config, MIN_IO_THREADS};
pub use consistency::{mean_rating, RatingSync};
pub use context::{AppContext, AppContextBuilder};
pub use error::{CoreError, CoreResult};
pub use handle::{HandleState, PersistenceHandle, SessionGuard};
pub use snapshot::{ExportReport, ImportReport, Snapshot};
pub use stats::Statistics;
