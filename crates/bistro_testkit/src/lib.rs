//! # Bistro Testkit
//!
//! Test utilities for Bistro.
//!
//! This crate provides:
//! - Test fixtures wiring an [`AppContext`](bistro_core::AppContext) over an in-memory store
//! - A scripted dump tool so backup and restore run without external programs
//! - Property-based test generators using proptest
//! - A reference-model harness for cache operation sequences
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bistro_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_context() {
//!     with_test_context(|t| {
//!         t.add_restaurant("Cafe X", "Downtown");
//!         t.add_review("Cafe X", 4, "good");
//!         assert_eq!(t.restaurants().get("Cafe X").unwrap().rating(), 4.0);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod scripted;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::scripted::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use scripted::*;
pub use stress::*;
