//! # docsync Testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - Fixtures for keys, documents, queries and mutations
//! - Property-based test generators using proptest
//! - A sync engine harness with a scripted backend
//! - Test logging through `tracing-subscriber`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[test]
//! fn listen_goes_current() {
//!     let mut h = SyncHarness::new();
//!     h.listen(query("rooms"));
//!     h.open_watch();
//!     h.watch_sync(&[TargetId(2)], vec![], version(1), "resume-1");
//!     assert!(!h.last_snapshot().unwrap().from_cache);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
