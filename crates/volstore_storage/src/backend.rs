//! Backend adapter trait definition.

use crate::error::StorageResult;
use crate::file::StorageFile;
use std::fmt;

/// The physical medium a backend adapter targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A local filesystem.
    Local,
    /// A distributed filesystem reached through network calls.
    Remote,
    /// Object storage used for cold archival.
    Archival,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Archival => "archival",
        };
        f.write_str(name)
    }
}

/// A namespace of storage files on one medium.
///
/// The adapter opens [`StorageFile`]s by logical name and performs the
/// namespace operations the vacuum cutover relies on. Names are flat
/// strings such as `"7.g2.dat"`; adapters map them onto their medium.
///
/// # Invariants
///
/// - every file returned by `open` owns its own medium connection
/// - `remove` of a missing name succeeds
/// - `rename` never leaves both names absent
/// - reads return the same bytes on every adapter
///
/// Archival files are the exception for mutation: archived volumes are
/// sealed, so `write_at` and `truncate` fail with a `Write` error and
/// `open` of a missing object fails instead of creating it.
///
/// # Implementors
///
/// - [`super::DiskBackend`] - local disk
/// - [`super::RemoteBackend`] - remote append-only filesystem
/// - [`super::ArchivalBackend`] - read-only object storage
pub trait Backend: Send + Sync + fmt::Debug {
    /// Returns the medium this adapter targets.
    fn kind(&self) -> BackendKind;

    /// Opens the named file, creating an empty one if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ConnectFailed`] if the medium is
    /// unreachable.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageFile>>;

    /// Returns true if the named file exists.
    fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Removes the named file. Removing a missing file succeeds.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Renames `from` to `to`, replacing `to` if the medium allows it.
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Lists file names starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Checks that `bytes` more can be written to the medium.
    ///
    /// The default accepts any hint.
    fn reserve(&self, bytes: u64) -> StorageResult<()> {
        let _ = bytes;
        Ok(())
    }
}
