//! # volstore Testkit
//!
//! Test utilities for volstore.
//!
//! This crate provides:
//! - Crash injection around any storage backend
//! - Test stores on temporary directories and in-process remote media
//! - Helpers that populate volumes with a known garbage fraction
//!
//! ## Usage
//!
//! ```rust
//! use volstore_core::VolumeId;
//! use volstore_testkit::prelude::*;
//!
//! let store = TestStore::disk();
//! let volume = store.create_volume(VolumeId::new(1)).unwrap();
//! let population = populate_with_garbage(&volume, 50, 512, 0.4).unwrap();
//! verify_population(&volume, &population).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
}

pub use crash::*;
pub use fixtures::*;
