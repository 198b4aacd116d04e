//! In-process remote filesystem for testing.
//!
//! [`MemoryNamespace`] stands in for the namespace of a remote distributed
//! filesystem and enforces the same restrictions as the real medium:
//! writes only append, there is no truncate, rename refuses an existing
//! destination, and handles go stale when their file is replaced, deleted
//! or renamed. A [`FaultPlan`] injects medium failures on demand.

use crate::error::{StorageError, StorageResult};
use crate::medium::{Connector, Medium, OpenMode, PathInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Failures to inject into a [`MemoryNamespace`].
///
/// Counters are consumed as failures fire. When `path_filter` is set, only
/// paths containing it are affected.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Fail any write that would push the bytes written past this budget.
    pub fail_writes_after: Option<u64>,
    /// Number of upcoming syncs to fail.
    pub fail_syncs: u32,
    /// Number of upcoming renames to fail.
    pub fail_renames: u32,
    /// Number of upcoming deletes to fail.
    pub fail_deletes: u32,
    /// Number of upcoming reads to fail.
    pub fail_reads: u32,
    /// Number of upcoming opens to fail.
    pub fail_opens: u32,
    /// Only inject faults on paths containing this string.
    pub path_filter: Option<String>,
}

impl FaultPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails writes once `bytes` have been written.
    #[must_use]
    pub fn fail_writes_after(mut self, bytes: u64) -> Self {
        self.fail_writes_after = Some(bytes);
        self
    }

    /// Fails the next `n` syncs.
    #[must_use]
    pub const fn fail_syncs(mut self, n: u32) -> Self {
        self.fail_syncs = n;
        self
    }

    /// Fails the next `n` renames.
    #[must_use]
    pub const fn fail_renames(mut self, n: u32) -> Self {
        self.fail_renames = n;
        self
    }

    /// Fails the next `n` deletes.
    #[must_use]
    pub const fn fail_deletes(mut self, n: u32) -> Self {
        self.fail_deletes = n;
        self
    }

    /// Fails the next `n` reads.
    #[must_use]
    pub const fn fail_reads(mut self, n: u32) -> Self {
        self.fail_reads = n;
        self
    }

    /// Fails the next `n` opens.
    #[must_use]
    pub const fn fail_opens(mut self, n: u32) -> Self {
        self.fail_opens = n;
        self
    }

    /// Restricts faults to paths containing `filter`.
    #[must_use]
    pub fn on_paths(mut self, filter: impl Into<String>) -> Self {
        self.path_filter = Some(filter.into());
        self
    }

    fn applies_to(&self, path: &str) -> bool {
        self.path_filter
            .as_deref()
            .map_or(true, |filter| path.contains(filter))
    }
}

#[derive(Debug)]
struct Node {
    incarnation: u64,
    data: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug)]
struct Inner {
    endpoint: String,
    files: RwLock<BTreeMap<String, Node>>,
    faults: Mutex<FaultPlan>,
    bytes_written: AtomicU64,
    available: AtomicBool,
    next_incarnation: AtomicU64,
    connections: AtomicU64,
    handles_opened: AtomicU64,
}

/// An in-process remote filesystem namespace.
///
/// Cloning shares the namespace, the way several clients share one
/// remote service.
#[derive(Debug, Clone)]
pub struct MemoryNamespace {
    inner: Arc<Inner>,
}

impl MemoryNamespace {
    /// Creates an empty namespace reachable at `endpoint`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.into(),
                files: RwLock::new(BTreeMap::new()),
                faults: Mutex::new(FaultPlan::default()),
                bytes_written: AtomicU64::new(0),
                available: AtomicBool::new(true),
                next_incarnation: AtomicU64::new(1),
                connections: AtomicU64::new(0),
                handles_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a connector producing connections to this namespace.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            namespace: self.clone(),
        }
    }

    /// Installs a fault plan and resets the write budget counter.
    pub fn set_faults(&self, plan: FaultPlan) {
        self.inner.bytes_written.store(0, Ordering::SeqCst);
        *self.inner.faults.lock() = plan;
    }

    /// Removes all injected faults.
    pub fn clear_faults(&self) {
        self.set_faults(FaultPlan::default());
    }

    /// Makes the endpoint reachable or unreachable for new connections.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Returns a copy of a file's physical content.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.files.read().get(path).map(|n| n.data.clone())
    }

    /// Seeds a file with content, replacing any existing one.
    pub fn put_file(&self, path: impl Into<String>, data: Vec<u8>) {
        let node = self.new_node(data);
        self.inner.files.write().insert(path.into(), node);
    }

    /// Returns all paths in the namespace.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.inner.files.read().keys().cloned().collect()
    }

    /// Returns the number of connections opened so far.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Returns the number of file handles opened so far.
    #[must_use]
    pub fn handles_opened(&self) -> u64 {
        self.inner.handles_opened.load(Ordering::SeqCst)
    }

    fn new_node(&self, data: Vec<u8>) -> Node {
        Node {
            incarnation: self.inner.next_incarnation.fetch_add(1, Ordering::SeqCst),
            data,
            modified: SystemTime::now(),
        }
    }

    /// Consumes one failure from the counter selected by `pick`, if armed.
    fn take_fault(&self, path: &str, pick: impl FnOnce(&mut FaultPlan) -> &mut u32) -> bool {
        let mut plan = self.inner.faults.lock();
        if !plan.applies_to(path) {
            return false;
        }
        let counter = pick(&mut *plan);
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn charge_write(&self, path: &str, len: u64) -> bool {
        let plan = self.inner.faults.lock();
        if !plan.applies_to(path) {
            return true;
        }
        match plan.fail_writes_after {
            Some(budget) => {
                let written = self.inner.bytes_written.load(Ordering::SeqCst);
                if written + len > budget {
                    false
                } else {
                    self.inner.bytes_written.store(written + len, Ordering::SeqCst);
                    true
                }
            }
            None => true,
        }
    }
}

fn injected(what: &str, path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("injected {what} failure on {path}"))
}

fn stale(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("stale handle on {path}"))
}

/// A handle on a [`MemoryFs`] file.
#[derive(Debug)]
pub struct MemoryHandle {
    path: String,
    incarnation: u64,
    mode: OpenMode,
    position: u64,
}

/// One connection to a [`MemoryNamespace`].
#[derive(Debug)]
pub struct MemoryFs {
    namespace: MemoryNamespace,
    endpoint: String,
}

impl MemoryFs {
    fn check_live(&self, handle: &MemoryHandle, files: &BTreeMap<String, Node>) -> io::Result<()> {
        match files.get(&handle.path) {
            Some(node) if node.incarnation == handle.incarnation => Ok(()),
            _ => Err(stale(&handle.path)),
        }
    }
}

impl Medium for MemoryFs {
    type Handle = MemoryHandle;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn open(&self, path: &str, mode: OpenMode) -> io::Result<MemoryHandle> {
        if self.namespace.take_fault(path, |p| &mut p.fail_opens) {
            return Err(injected("open", path));
        }

        let incarnation = match mode {
            OpenMode::Read | OpenMode::Append => {
                let files = self.namespace.inner.files.read();
                let node = files.get(path).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("{path} does not exist"))
                })?;
                node.incarnation
            }
            OpenMode::Create => {
                let node = self.namespace.new_node(Vec::new());
                let incarnation = node.incarnation;
                self.namespace
                    .inner
                    .files
                    .write()
                    .insert(path.to_string(), node);
                incarnation
            }
        };

        self.namespace
            .inner
            .handles_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(MemoryHandle {
            path: path.to_string(),
            incarnation,
            mode,
            position: 0,
        })
    }

    fn read(&self, handle: &mut MemoryHandle, buf: &mut [u8]) -> io::Result<usize> {
        if handle.mode != OpenMode::Read {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "handle not opened for reading",
            ));
        }
        if self.namespace.take_fault(&handle.path, |p| &mut p.fail_reads) {
            return Err(injected("read", &handle.path));
        }

        let files = self.namespace.inner.files.read();
        self.check_live(handle, &files)?;
        let data = &files[&handle.path].data;

        let start = usize::try_from(handle.position)
            .unwrap_or(usize::MAX)
            .min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        handle.position += n as u64;
        Ok(n)
    }

    fn seek(&self, handle: &mut MemoryHandle, offset: u64) -> io::Result<()> {
        if handle.mode != OpenMode::Read {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write handles cannot seek",
            ));
        }
        let files = self.namespace.inner.files.read();
        self.check_live(handle, &files)?;
        let len = files[&handle.path].data.len() as u64;
        if offset > len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seek to {offset} past end {len}"),
            ));
        }
        handle.position = offset;
        Ok(())
    }

    fn write(&self, handle: &mut MemoryHandle, buf: &[u8]) -> io::Result<usize> {
        if handle.mode == OpenMode::Read {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "handle not opened for writing",
            ));
        }
        if !self.namespace.charge_write(&handle.path, buf.len() as u64) {
            return Err(injected("write", &handle.path));
        }

        let mut files = self.namespace.inner.files.write();
        self.check_live(handle, &files)?;
        if let Some(node) = files.get_mut(&handle.path) {
            node.data.extend_from_slice(buf);
            node.modified = SystemTime::now();
        }
        Ok(buf.len())
    }

    fn sync(&self, handle: &mut MemoryHandle) -> io::Result<()> {
        if self.namespace.take_fault(&handle.path, |p| &mut p.fail_syncs) {
            return Err(injected("sync", &handle.path));
        }
        let files = self.namespace.inner.files.read();
        self.check_live(handle, &files)
    }

    fn close(&self, _handle: MemoryHandle) -> io::Result<()> {
        Ok(())
    }

    fn path_info(&self, path: &str) -> io::Result<Option<PathInfo>> {
        Ok(self.namespace.inner.files.read().get(path).map(|n| PathInfo {
            size: n.data.len() as u64,
            modified: n.modified,
        }))
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        if self.namespace.take_fault(path, |p| &mut p.fail_deletes) {
            return Err(injected("delete", path));
        }
        match self.namespace.inner.files.write().remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{path} does not exist"),
            )),
        }
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        if self.namespace.take_fault(from, |p| &mut p.fail_renames) {
            return Err(injected("rename", from));
        }
        let mut files = self.namespace.inner.files.write();
        if files.contains_key(to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("rename destination {to} exists"),
            ));
        }
        let node = files.remove(from).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{from} does not exist"))
        })?;
        files.insert(to.to_string(), node);
        Ok(())
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        Ok(self
            .namespace
            .inner
            .files
            .read()
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, _)| path.clone())
            .collect())
    }
}

/// Connects to a [`MemoryNamespace`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    namespace: MemoryNamespace,
}

impl Connector for MemoryConnector {
    type Medium = MemoryFs;

    fn endpoint(&self) -> &str {
        &self.namespace.inner.endpoint
    }

    fn connect(&self) -> StorageResult<MemoryFs> {
        if !self.namespace.inner.available.load(Ordering::SeqCst) {
            return Err(StorageError::connect_failed(
                self.endpoint(),
                "endpoint unavailable",
            ));
        }
        self.namespace
            .inner
            .connections
            .fetch_add(1, Ordering::SeqCst);
        Ok(MemoryFs {
            namespace: self.namespace.clone(),
            endpoint: self.namespace.inner.endpoint.clone(),
        })
    }
}
