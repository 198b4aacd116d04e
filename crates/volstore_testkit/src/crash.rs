//! Crash simulation for volume and vacuum tests.
//!
//! [`CrashableBackend`] wraps any [`Backend`] and hands out
//! [`CrashableFile`]s that share one crash plan. A test arms the plan
//! (fail after N written bytes, fail syncs, fail opens), optionally
//! narrowed to paths containing a substring, runs an operation and then
//! checks what the inner backend holds.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use volstore_storage::{Backend, MemoryNamespace, RemoteBackend, StorageConfig, StorageFile};
//! use volstore_testkit::CrashableBackend;
//!
//! let ns = MemoryNamespace::new("mem://crash");
//! let inner = Arc::new(RemoteBackend::connect(ns.connector(), &StorageConfig::default()).unwrap());
//! let backend = CrashableBackend::new(inner);
//! backend.only_paths(".g1.");
//! backend.crash_after(64);
//!
//! let mut file = backend.open("1.g1.dat").unwrap();
//! assert!(file.write_at(&[1u8; 128], 0).is_err());
//! assert!(backend.has_crashed());
//! ```

use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use volstore_storage::{
    Backend, BackendKind, FileStat, StorageError, StorageFile, StorageResult,
};

/// Failure settings shared by a backend and its files.
#[derive(Debug)]
struct CrashPlan {
    filter: Mutex<Option<String>>,
    crash_after_bytes: AtomicU64,
    bytes_written: AtomicU64,
    fail_on_sync: AtomicBool,
    fail_on_open: AtomicBool,
    crashed: AtomicBool,
}

impl Default for CrashPlan {
    fn default() -> Self {
        Self {
            filter: Mutex::new(None),
            crash_after_bytes: AtomicU64::new(u64::MAX),
            bytes_written: AtomicU64::new(0),
            fail_on_sync: AtomicBool::new(false),
            fail_on_open: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
        }
    }
}

impl CrashPlan {
    fn applies_to(&self, path: &str) -> bool {
        self.filter
            .lock()
            .as_deref()
            .map_or(true, |filter| path.contains(filter))
    }

    fn crash(&self, what: &str) -> io::Error {
        self.crashed.store(true, Ordering::SeqCst);
        io::Error::new(io::ErrorKind::Other, format!("simulated crash during {what}"))
    }
}

/// A backend wrapper that can simulate crashes.
#[derive(Debug, Clone)]
pub struct CrashableBackend {
    inner: Arc<dyn Backend>,
    plan: Arc<CrashPlan>,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend.
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            plan: Arc::new(CrashPlan::default()),
        }
    }

    /// Returns the wrapped backend.
    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }

    /// Restricts failures to paths containing `filter`.
    pub fn only_paths(&self, filter: impl Into<String>) {
        *self.plan.filter.lock() = Some(filter.into());
    }

    /// Fails writes once `bytes` more bytes have been written. The write
    /// crossing the limit stores its prefix up to the limit.
    pub fn crash_after(&self, bytes: u64) {
        self.plan.bytes_written.store(0, Ordering::SeqCst);
        self.plan.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether sync should fail.
    pub fn set_fail_on_sync(&self, fail: bool) {
        self.plan.fail_on_sync.store(fail, Ordering::SeqCst);
    }

    /// Sets whether opening a file should fail.
    pub fn set_fail_on_open(&self, fail: bool) {
        self.plan.fail_on_open.store(fail, Ordering::SeqCst);
    }

    /// Resets the crash state.
    pub fn reset(&self) {
        *self.plan.filter.lock() = None;
        self.plan.crash_after_bytes.store(u64::MAX, Ordering::SeqCst);
        self.plan.bytes_written.store(0, Ordering::SeqCst);
        self.plan.fail_on_sync.store(false, Ordering::SeqCst);
        self.plan.fail_on_open.store(false, Ordering::SeqCst);
        self.plan.crashed.store(false, Ordering::SeqCst);
    }

    /// Returns whether a simulated crash has happened.
    pub fn has_crashed(&self) -> bool {
        self.plan.crashed.load(Ordering::SeqCst)
    }

    /// Returns the bytes written to matching paths since the last arm.
    pub fn bytes_written(&self) -> u64 {
        self.plan.bytes_written.load(Ordering::SeqCst)
    }
}

impl Backend for CrashableBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageFile>> {
        if self.plan.fail_on_open.load(Ordering::SeqCst) && self.plan.applies_to(name) {
            return Err(StorageError::Io(self.plan.crash("open")));
        }
        let inner = self.inner.open(name)?;
        Ok(Box::new(CrashableFile {
            inner,
            plan: Arc::clone(&self.plan),
        }))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        self.inner.exists(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.inner.remove(name)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.rename(from, to)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix)
    }

    fn reserve(&self, bytes: u64) -> StorageResult<()> {
        self.inner.reserve(bytes)
    }
}

/// A file handed out by [`CrashableBackend`].
#[derive(Debug)]
pub struct CrashableFile {
    inner: Box<dyn StorageFile>,
    plan: Arc<CrashPlan>,
}

impl StorageFile for CrashableFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        self.inner.read_at(buf, offset)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        if !self.plan.applies_to(self.inner.name()) {
            return self.inner.write_at(buf, offset);
        }

        let len = buf.len() as u64;
        let current = self.plan.bytes_written.fetch_add(len, Ordering::SeqCst);
        let threshold = self.plan.crash_after_bytes.load(Ordering::SeqCst);

        if current >= threshold {
            let err = self.plan.crash("write");
            return Err(StorageError::write(self.inner.name(), offset, err));
        }

        // Check if this write will cross the crash threshold
        if current + len > threshold {
            let partial = (threshold - current) as usize;
            if partial > 0 {
                let _ = self.inner.write_at(&buf[..partial], offset);
            }
            let err = self.plan.crash("partial write");
            return Err(StorageError::write(self.inner.name(), offset, err));
        }

        self.inner.write_at(buf, offset)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.plan.fail_on_sync.load(Ordering::SeqCst) && self.plan.applies_to(self.inner.name())
        {
            return Err(StorageError::Io(self.plan.crash("sync")));
        }
        self.inner.sync()
    }

    fn close(&mut self) -> StorageResult<()> {
        self.inner.close()
    }

    fn stat(&self) -> StorageResult<FileStat> {
        self.inner.stat()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
