//! # volstore Core
//!
//! Volume engine for volstore.
//!
//! This crate provides:
//! - Needle records and the per-volume needle map
//! - Volumes: append-only data files with crash recovery
//! - The store: every volume on one backend
//! - Online vacuum: check, compact, commit and cleanup phases that
//!   reclaim deleted space while reads continue
//! - Archival of sealed volumes to object storage
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use volstore_core::{NeedleId, Store, StoreConfig, VacuumCoordinator, VolumeId};
//! use volstore_storage::{Backend, MemoryNamespace, RemoteBackend};
//!
//! let namespace = MemoryNamespace::new("mem://cluster");
//! let config = StoreConfig::default();
//! let backend: Arc<dyn Backend> =
//!     Arc::new(RemoteBackend::connect(namespace.connector(), &config.storage).unwrap());
//! let store = Arc::new(Store::open(backend, config).unwrap());
//!
//! let volume = store.create_volume(VolumeId::new(1)).unwrap();
//! volume.write_needle(NeedleId::new(1), b"keep").unwrap();
//! volume.write_needle(NeedleId::new(2), b"drop").unwrap();
//! volume.delete_needle(NeedleId::new(2)).unwrap();
//!
//! let vacuum = VacuumCoordinator::new(Arc::clone(&store));
//! assert!(vacuum.check(VolumeId::new(1)).unwrap() > 0.0);
//! vacuum.compact(VolumeId::new(1), 0).unwrap().run().unwrap();
//! vacuum.commit(VolumeId::new(1)).unwrap();
//! vacuum.cleanup(VolumeId::new(1)).unwrap();
//!
//! assert_eq!(volume.read_needle(NeedleId::new(1)).unwrap(), b"keep");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
pub mod layout;
mod needle;
mod needle_map;
mod store;
mod superblock;
mod types;
mod vacuum;
mod volume;

pub use config::StoreConfig;
pub use error::{CoreError, CoreResult};
pub use needle::{checksum, Needle, NeedleFlags, NeedleHeader, NEEDLE_CHECKSUM_SIZE, NEEDLE_HEADER_SIZE};
pub use needle_map::{NeedleLocation, NeedleMap};
pub use store::Store;
pub use superblock::{Superblock, FORMAT_VERSION, SUPERBLOCK_MAGIC, SUPERBLOCK_SIZE};
pub use types::{Generation, NeedleId, VolumeId};
pub use vacuum::{
    load_average_1m, CommitOutcome, CompactProgress, CompactStream, VacuumCoordinator,
    VacuumPhase, VacuumSession,
};
pub use volume::{Volume, VolumeInfo};
