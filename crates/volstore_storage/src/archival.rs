//! Archival object storage backend.
//!
//! Archived volume files are sealed. They are served for range reads
//! straight from the object store, and every mutation fails with
//! [`io::ErrorKind::Unsupported`] wrapped in a [`StorageError::Write`].

use crate::backend::{Backend, BackendKind};
use crate::error::{StorageError, StorageResult};
use crate::file::{readable_len, Alignment, FileStat, StorageFile};
use crate::objstore::{ObjectLocation, ObjectStore};
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace};

fn sealed() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "archived objects are sealed")
}

/// A read-only storage file backed by one archived object.
#[derive(Debug)]
pub struct ArchivalFile {
    store: Option<Arc<dyn ObjectStore>>,
    location: ObjectLocation,
    name: String,
    size: u64,
    physical: u64,
    modified: SystemTime,
}

impl ArchivalFile {
    /// Opens the archived object at `location`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConnectFailed`] if the store cannot be
    /// reached or holds no such object.
    pub fn open(
        store: Arc<dyn ObjectStore>,
        location: ObjectLocation,
        alignment: Alignment,
    ) -> StorageResult<Self> {
        let endpoint = location.bucket.clone();
        let info = store
            .head(&location)
            .map_err(|e| StorageError::connect_failed(&endpoint, format!("{location}: {e}")))?
            .ok_or_else(|| StorageError::connect_failed(&endpoint, format!("no object {location}")))?;

        debug!(location = %location, size = info.size, "opened archived object");
        Ok(Self {
            name: location.key.clone(),
            size: alignment.align_up(info.size),
            physical: info.size,
            modified: info.modified,
            store: Some(store),
            location,
        })
    }

    /// Returns where the object lives.
    #[must_use]
    pub fn location(&self) -> &ObjectLocation {
        &self.location
    }

    fn store(&self) -> StorageResult<&dyn ObjectStore> {
        self.store
            .as_deref()
            .ok_or_else(|| StorageError::closed(&self.name))
    }
}

impl StorageFile for ArchivalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        let store = self.store()?;
        if self.physical == 0 || offset >= self.size {
            return Err(StorageError::end_of_stream(&self.name, offset));
        }

        let want = readable_len(self.size, offset, buf.len());
        let stored = readable_len(self.physical, offset, want);
        let mut filled = 0usize;
        while filled < stored {
            let at = offset + filled as u64;
            let n = store
                .get_range(&self.location, at, &mut buf[filled..stored])
                .map_err(|e| StorageError::read(&self.name, at, e))?;
            if n == 0 {
                return Err(StorageError::read(
                    &self.name,
                    at,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "object shorter than recorded"),
                ));
            }
            filled += n;
        }
        buf[stored..want].fill(0);

        trace!(path = %self.name, offset, len = want, "read");
        Ok(want)
    }

    fn write_at(&mut self, _buf: &[u8], offset: u64) -> StorageResult<usize> {
        self.store()?;
        Err(StorageError::write(&self.name, offset, sealed()))
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.store()?;
        Err(StorageError::write(&self.name, new_size, sealed()))
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.store()?;
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.store = None;
        Ok(())
    }

    fn stat(&self) -> StorageResult<FileStat> {
        self.store()?;
        Ok(FileStat {
            size: self.size,
            modified: self.modified,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A read-only backend adapter over one bucket of an object store.
#[derive(Debug, Clone)]
pub struct ArchivalBackend {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    alignment: Alignment,
}

impl ArchivalBackend {
    /// Creates an adapter serving file names as keys of `bucket`.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, alignment: Alignment) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            alignment,
        }
    }

    /// Returns the bucket files are served from.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn location(&self, name: &str) -> ObjectLocation {
        ObjectLocation::new(self.bucket.clone(), name)
    }
}

impl Backend for ArchivalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Archival
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageFile>> {
        let file = ArchivalFile::open(Arc::clone(&self.store), self.location(name), self.alignment)?;
        Ok(Box::new(file))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.store.head(&self.location(name))?.is_some())
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.store.delete(&self.location(name))?;
        Ok(())
    }

    fn rename(&self, _from: &str, _to: &str) -> StorageResult<()> {
        Err(StorageError::Io(sealed()))
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = self.store.list(&self.bucket, prefix)?;
        keys.sort();
        Ok(keys)
    }
}
