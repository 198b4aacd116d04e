//! # volstore Storage
//!
//! Storage file contract and backend adapters for volstore volumes.
//!
//! A volume file is an aligned, append-mostly byte array. This crate
//! defines that contract as [`StorageFile`] and implements it over three
//! media:
//!
//! - [`DiskFile`] / [`DiskBackend`] - local disk
//! - [`RemoteFile`] / [`RemoteBackend`] - a remote filesystem whose native
//!   writes only append and which has no truncate
//! - [`ArchivalFile`] / [`ArchivalBackend`] - sealed objects in cold
//!   object storage
//!
//! Sealed volume files are moved into object storage with
//! [`ArchivalUploader`].
//!
//! ## Design Principles
//!
//! - Files are opaque byte arrays; needles and superblocks belong to the
//!   volume engine
//! - Every write offset is a multiple of the [`Alignment`] unit and every
//!   write is zero-padded to it
//! - Shrinking is all-or-nothing on every medium
//! - Each opened file owns its medium connection
//!
//! ## Example
//!
//! ```rust
//! use volstore_storage::{Backend, MemoryNamespace, RemoteBackend, StorageConfig, StorageFile};
//!
//! let namespace = MemoryNamespace::new("mem://cluster");
//! let backend = RemoteBackend::connect(namespace.connector(), &StorageConfig::default()).unwrap();
//!
//! let mut file = backend.open("7.g0.dat").unwrap();
//! file.write_at(b"needle", 0).unwrap();
//! assert_eq!(file.stat().unwrap().size, 8);
//!
//! file.truncate(0).unwrap();
//! assert_eq!(file.stat().unwrap().size, 0);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod archival;
mod backend;
mod config;
mod disk;
mod error;
mod file;
mod medium;
mod memfs;
mod objstore;
mod remote;
mod upload;

pub use archival::{ArchivalBackend, ArchivalFile};
pub use backend::{Backend, BackendKind};
pub use config::{StorageConfig, UploadConfig};
pub use disk::{DiskBackend, DiskFile};
pub use error::{StorageError, StorageResult};
pub use file::{Alignment, FileStat, HandlePolicy, StorageFile, NEEDLE_PADDING_SIZE};
pub use medium::{Connector, Medium, OpenMode, PathInfo};
pub use memfs::{FaultPlan, MemoryConnector, MemoryFs, MemoryHandle, MemoryNamespace};
pub use objstore::{
    CompletedPart, DirObjectStore, MemoryObjectStore, ObjectInfo, ObjectLocation, ObjectStore,
};
pub use remote::{RemoteBackend, RemoteFile, STAGING_SUFFIX};
pub use upload::{compute_part_size, ArchivalUploader, UploadJob, UploadReport};
