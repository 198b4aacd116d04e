//! Capability interface of a remote filesystem medium.
//!
//! A remote distributed filesystem is reached only through network calls,
//! and its native API is narrower than a local disk's:
//!
//! - write handles only append
//! - there is no truncate primitive
//! - rename may refuse to replace an existing destination
//!
//! [`Medium`] captures exactly that surface, so the remote adapter can
//! build the full [`crate::StorageFile`] contract on top of it regardless
//! of which client library provides the calls.

use crate::error::StorageResult;
use std::fmt;
use std::io;
use std::time::SystemTime;

/// How a medium handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; the file must exist.
    Read,
    /// Append-only writes to an existing file.
    Append,
    /// Create a new empty file, replacing any existing one, for appending.
    Create,
}

/// Metadata of a path on the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathInfo {
    /// Physical length in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
}

/// One connection to a remote filesystem.
pub trait Medium: Send + Sync + fmt::Debug {
    /// An open file handle on this connection.
    type Handle: Send + fmt::Debug;

    /// Returns the endpoint this connection was made to.
    fn endpoint(&self) -> &str;

    /// Opens a handle on `path`.
    fn open(&self, path: &str, mode: OpenMode) -> io::Result<Self::Handle>;

    /// Reads from the handle's current position.
    fn read(&self, handle: &mut Self::Handle, buf: &mut [u8]) -> io::Result<usize>;

    /// Positions a read handle at `offset`.
    fn seek(&self, handle: &mut Self::Handle, offset: u64) -> io::Result<()>;

    /// Appends `buf` through a write handle.
    fn write(&self, handle: &mut Self::Handle, buf: &[u8]) -> io::Result<usize>;

    /// Flushes a write handle and waits until the data is durable.
    fn sync(&self, handle: &mut Self::Handle) -> io::Result<()>;

    /// Closes a handle.
    fn close(&self, handle: Self::Handle) -> io::Result<()>;

    /// Returns metadata for `path`, or `None` if it does not exist.
    fn path_info(&self, path: &str) -> io::Result<Option<PathInfo>>;

    /// Deletes `path`.
    fn delete(&self, path: &str) -> io::Result<()>;

    /// Renames `from` to `to`.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    /// Lists paths starting with `prefix`.
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Returns true if `rename` atomically replaces an existing destination.
    fn supports_rename_over(&self) -> bool {
        false
    }
}

/// Produces a fresh medium connection for each storage file.
pub trait Connector: Send + Sync + fmt::Debug {
    /// The connection type.
    type Medium: Medium;

    /// Returns the endpoint connections are made to.
    fn endpoint(&self) -> &str;

    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ConnectFailed`] if the endpoint is unreachable.
    fn connect(&self) -> StorageResult<Self::Medium>;
}
