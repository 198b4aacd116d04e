//! Remote filesystem backend.
//!
//! [`RemoteFile`] builds the full [`StorageFile`] contract on top of a
//! [`Medium`] whose writes only append and which has no truncate. Any
//! change that is not a pure append goes through a two-phase rewrite:
//!
//! 1. Stage: copy the bytes that survive (plus any inserted data) into
//!    `<name>.truncating` and make it durable. Failing here only discards
//!    the temporary file; the original and its handles are untouched.
//! 2. Swap: replace the original with the temporary file, by a single
//!    rename where the medium can rename over an existing file, otherwise
//!    by delete followed by rename. A rename that fails after the delete
//!    is retried on the next call, and reads are served from the
//!    temporary file until then.

use crate::backend::{Backend, BackendKind};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::file::{readable_len, FileStat, HandlePolicy, StorageFile};
use crate::medium::{Connector, Medium, OpenMode};
use parking_lot::Mutex;
use std::io;
use std::time::SystemTime;
use tracing::{debug, info, trace, warn};

/// Suffix of the staging file used by shrink and overwrite.
pub const STAGING_SUFFIX: &str = ".truncating";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapOutcome {
    Done,
    Pending,
}

/// A storage file on a remote append-only filesystem.
///
/// Each file owns its connection. Handle lifetime follows the configured
/// [`HandlePolicy`]; both policies give the same observable results.
#[derive(Debug)]
pub struct RemoteFile<M: Medium> {
    medium: Option<M>,
    name: String,
    staging_name: String,
    /// Logical size, padded to the alignment unit at open.
    size: u64,
    /// Bytes actually stored on the medium.
    physical: u64,
    modified: SystemTime,
    empty: bool,
    config: StorageConfig,
    reader: Mutex<Option<M::Handle>>,
    writer: Mutex<Option<M::Handle>>,
    pending_swap: bool,
}

impl<M: Medium> RemoteFile<M> {
    /// Opens `name` on `medium`, creating an empty file if it does not exist.
    ///
    /// A staging file left behind by an interrupted shrink is resolved
    /// first: discarded if the original still exists, renamed into place
    /// if the original was already deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConnectFailed`] if the medium cannot serve the file.
    pub fn open(medium: M, name: &str, config: &StorageConfig) -> StorageResult<Self> {
        let staging_name = format!("{name}{STAGING_SUFFIX}");
        let endpoint = medium.endpoint().to_string();
        let fatal = |e: io::Error| StorageError::connect_failed(&endpoint, format!("{name}: {e}"));

        let original = medium.path_info(name).map_err(fatal)?;
        let staged = medium.path_info(&staging_name).map_err(fatal)?;
        let original = match (original, staged) {
            (Some(info), Some(_)) => {
                warn!(path = %name, "discarding staging file of an interrupted rewrite");
                medium.delete(&staging_name).map_err(fatal)?;
                Some(info)
            }
            (None, Some(_)) => {
                info!(path = %name, "completing interrupted rewrite swap");
                medium.rename(&staging_name, name).map_err(fatal)?;
                medium.path_info(name).map_err(fatal)?
            }
            (original, None) => original,
        };

        let (physical, modified) = match original {
            Some(info) => (info.size, info.modified),
            None => {
                let mut handle = medium.open(name, OpenMode::Create).map_err(fatal)?;
                medium.sync(&mut handle).map_err(fatal)?;
                medium.close(handle).map_err(fatal)?;
                (0, SystemTime::now())
            }
        };

        let size = config.alignment.align_up(physical);
        debug!(path = %name, physical, size, policy = ?config.handle_policy, "opened remote file");

        let file = Self {
            medium: Some(medium),
            name: name.to_string(),
            staging_name,
            size,
            physical,
            modified,
            empty: physical == 0,
            config: config.clone(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            pending_swap: false,
        };
        if file.config.handle_policy == HandlePolicy::Persistent {
            file.open_persistent().map_err(fatal)?;
        }
        Ok(file)
    }

    fn medium(&self) -> StorageResult<&M> {
        self.medium
            .as_ref()
            .ok_or_else(|| StorageError::closed(&self.name))
    }

    /// Path currently holding the data.
    fn data_path(&self) -> &str {
        if self.pending_swap {
            &self.staging_name
        } else {
            &self.name
        }
    }

    fn open_persistent(&self) -> io::Result<()> {
        let Some(medium) = self.medium.as_ref() else {
            return Ok(());
        };
        let reader = medium.open(self.data_path(), OpenMode::Read)?;
        *self.reader.lock() = Some(reader);
        if !self.pending_swap {
            let writer = medium.open(&self.name, OpenMode::Append)?;
            *self.writer.lock() = Some(writer);
        }
        Ok(())
    }

    fn release_handles(&self) {
        let Some(medium) = self.medium.as_ref() else {
            return;
        };
        if let Some(mut writer) = self.writer.lock().take() {
            if let Err(e) = medium.sync(&mut writer) {
                warn!(path = %self.name, error = %e, "failed to sync write handle on release");
            }
            if let Err(e) = medium.close(writer) {
                warn!(path = %self.name, error = %e, "failed to close write handle");
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            if let Err(e) = medium.close(reader) {
                warn!(path = %self.name, error = %e, "failed to close read handle");
            }
        }
    }

    fn reopen_handles(&self) {
        if self.config.handle_policy != HandlePolicy::Persistent {
            return;
        }
        let attempts = self.config.reopen_attempts.max(1);
        for attempt in 1..=attempts {
            match self.open_persistent() {
                Ok(()) => return,
                Err(e) => {
                    warn!(path = %self.name, attempt, error = %e, "failed to reopen handles");
                }
            }
        }
        // Handles stay empty and are reopened by the next operation.
        self.release_handles();
    }

    fn flush_writer(&self) -> StorageResult<()> {
        let medium = self.medium()?;
        if let Some(writer) = self.writer.lock().as_mut() {
            medium
                .sync(writer)
                .map_err(|e| StorageError::write(&self.name, self.physical, e))?;
        }
        Ok(())
    }

    fn read_with(
        &self,
        medium: &M,
        handle: &mut M::Handle,
        buf: &mut [u8],
        offset: u64,
    ) -> StorageResult<()> {
        medium
            .seek(handle, offset)
            .map_err(|e| StorageError::seek(&self.name, offset, e))?;

        let mut filled = 0usize;
        while filled < buf.len() {
            let at = offset + filled as u64;
            let n = medium
                .read(handle, &mut buf[filled..])
                .map_err(|e| StorageError::read(&self.name, at, e))?;
            if n == 0 {
                return Err(StorageError::read(
                    &self.name,
                    at,
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "medium holds fewer bytes than recorded",
                    ),
                ));
            }
            filled += n;
        }
        Ok(())
    }

    fn read_physical(&self, buf: &mut [u8], offset: u64) -> StorageResult<()> {
        let medium = self.medium()?;
        let open_reader = || {
            medium
                .open(self.data_path(), OpenMode::Read)
                .map_err(|e| StorageError::read(&self.name, offset, e))
        };

        match self.config.handle_policy {
            HandlePolicy::PerOperation => {
                let mut handle = open_reader()?;
                let result = self.read_with(medium, &mut handle, buf, offset);
                if let Err(e) = medium.close(handle) {
                    warn!(path = %self.name, error = %e, "failed to close read handle");
                }
                result
            }
            HandlePolicy::Persistent => {
                let mut reader = self.reader.lock();
                if let Some(mut handle) = reader.take() {
                    match self.read_with(medium, &mut handle, buf, offset) {
                        Ok(()) => {
                            *reader = Some(handle);
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(path = %self.name, error = %e, "read handle unusable, reopening");
                            let _ = medium.close(handle);
                        }
                    }
                }
                let mut handle = open_reader()?;
                let result = self.read_with(medium, &mut handle, buf, offset);
                *reader = Some(handle);
                result
            }
        }
    }

    fn write_all(
        &self,
        medium: &M,
        handle: &mut M::Handle,
        path: &str,
        buf: &[u8],
        at: u64,
    ) -> StorageResult<()> {
        let mut written = 0usize;
        while written < buf.len() {
            let offset = at + written as u64;
            let n = medium
                .write(handle, &buf[written..])
                .map_err(|e| StorageError::write(path, offset, e))?;
            if n == 0 {
                return Err(StorageError::write(
                    path,
                    offset,
                    io::Error::new(io::ErrorKind::WriteZero, "medium accepted no bytes"),
                ));
            }
            written += n;
        }
        Ok(())
    }

    /// Appends `gap` zero bytes followed by `data` at the physical end.
    fn write_pieces(
        &self,
        medium: &M,
        handle: &mut M::Handle,
        gap: u64,
        data: &[u8],
    ) -> StorageResult<()> {
        let mut at = self.physical;
        if gap > 0 {
            let chunk = usize::try_from(gap)
                .unwrap_or(usize::MAX)
                .min(self.config.copy_chunk_size);
            let zeros = vec![0u8; chunk];
            let mut left = gap;
            while left > 0 {
                let n = usize::try_from(left).unwrap_or(usize::MAX).min(zeros.len());
                self.write_all(medium, handle, &self.name, &zeros[..n], at)?;
                at += n as u64;
                left -= n as u64;
            }
        }
        self.write_all(medium, handle, &self.name, data, at)
    }

    fn append_physical(&self, gap: u64, data: &[u8]) -> StorageResult<()> {
        let medium = self.medium()?;
        let open_writer = || {
            medium
                .open(&self.name, OpenMode::Append)
                .map_err(|e| StorageError::write(&self.name, self.physical, e))
        };

        match self.config.handle_policy {
            HandlePolicy::PerOperation => {
                let mut handle = open_writer()?;
                let result = self.write_pieces(medium, &mut handle, gap, data).and_then(|()| {
                    medium
                        .sync(&mut handle)
                        .map_err(|e| StorageError::write(&self.name, self.physical, e))
                });
                if let Err(e) = medium.close(handle) {
                    warn!(path = %self.name, error = %e, "failed to close write handle");
                }
                result
            }
            HandlePolicy::Persistent => {
                let mut writer = self.writer.lock();
                let mut handle = match writer.take() {
                    Some(handle) => handle,
                    None => open_writer()?,
                };
                match self.write_pieces(medium, &mut handle, gap, data) {
                    Ok(()) => {
                        *writer = Some(handle);
                        Ok(())
                    }
                    Err(e) => {
                        let _ = medium.close(handle);
                        // Retrying is only safe if nothing reached the medium.
                        let untouched = matches!(
                            medium.path_info(&self.name),
                            Ok(Some(info)) if info.size == self.physical
                        );
                        if !untouched {
                            return Err(e);
                        }
                        debug!(path = %self.name, error = %e, "write handle unusable, reopening");
                        let mut handle = open_writer()?;
                        let result = self.write_pieces(medium, &mut handle, gap, data);
                        *writer = Some(handle);
                        result
                    }
                }
            }
        }
    }

    /// Reloads the physical length after a failed append. Part of the gap
    /// or data may have reached the medium before the failure.
    fn resync_physical(&mut self) {
        let Some(medium) = self.medium.as_ref() else {
            return;
        };
        match medium.path_info(&self.name) {
            Ok(Some(info)) => {
                if info.size != self.physical {
                    debug!(
                        path = %self.name,
                        tracked = self.physical,
                        actual = info.size,
                        "physical length changed by failed append"
                    );
                }
                self.physical = info.size;
            }
            Ok(None) => warn!(path = %self.name, "file vanished after failed append"),
            Err(e) => warn!(path = %self.name, error = %e, "failed to reload physical length"),
        }
    }

    fn copy_range(
        &self,
        medium: &M,
        src: &mut M::Handle,
        out: &mut M::Handle,
        range: (u64, u64),
        buf: &mut [u8],
        written: &mut u64,
    ) -> StorageResult<()> {
        let (from, to) = range;
        medium
            .seek(src, from)
            .map_err(|e| StorageError::seek(&self.name, from, e))?;

        let mut at = from;
        while at < to {
            let want = usize::try_from(to - at).unwrap_or(usize::MAX).min(buf.len());
            let n = medium
                .read(src, &mut buf[..want])
                .map_err(|e| StorageError::read(&self.name, at, e))?;
            if n == 0 {
                return Err(StorageError::read(
                    &self.name,
                    at,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "source ended during copy"),
                ));
            }
            self.write_all(medium, out, &self.staging_name, &buf[..n], *written)?;
            at += n as u64;
            *written += n as u64;
        }
        Ok(())
    }

    fn copy_into(
        &self,
        medium: &M,
        out: &mut M::Handle,
        keep: u64,
        insert: &[u8],
        resume_at: u64,
    ) -> StorageResult<()> {
        let mut src = medium
            .open(&self.name, OpenMode::Read)
            .map_err(|e| StorageError::read(&self.name, 0, e))?;

        let mut buf = vec![0u8; self.config.copy_chunk_size];
        let mut written = 0u64;
        let mut result = self.copy_range(medium, &mut src, out, (0, keep), &mut buf, &mut written);
        if result.is_ok() && !insert.is_empty() {
            result = self.write_all(medium, out, &self.staging_name, insert, written);
            written += insert.len() as u64;
        }
        if result.is_ok() && resume_at < self.physical {
            result = self.copy_range(
                medium,
                &mut src,
                out,
                (resume_at, self.physical),
                &mut buf,
                &mut written,
            );
        }
        let _ = medium.close(src);
        result?;

        medium
            .sync(out)
            .map_err(|e| StorageError::write(&self.staging_name, written, e))
    }

    /// Phase one: writes `[0, keep) ++ insert ++ [resume_at, physical)` into
    /// the staging file and makes it durable.
    fn stage_rewrite(&self, keep: u64, insert: &[u8], resume_at: u64) -> StorageResult<()> {
        let medium = self.medium()?;
        let staging = &self.staging_name;

        let leftover = medium
            .path_info(staging)
            .map_err(|e| StorageError::write(staging, 0, e))?;
        if leftover.is_some() {
            medium
                .delete(staging)
                .map_err(|e| StorageError::write(staging, 0, e))?;
        }

        let mut out = medium
            .open(staging, OpenMode::Create)
            .map_err(|e| StorageError::write(staging, 0, e))?;
        let staged = self.copy_into(medium, &mut out, keep, insert, resume_at);
        let closed = medium
            .close(out)
            .map_err(|e| StorageError::write(staging, 0, e));

        if let Err(e) = staged.and(closed) {
            if let Err(cleanup) = medium.delete(staging) {
                warn!(path = %staging, error = %cleanup, "failed to discard staging file");
            }
            return Err(e);
        }
        debug!(path = %self.name, keep, inserted = insert.len(), "staged rewrite");
        Ok(())
    }

    /// Phase two: replaces the original with the staging file.
    fn swap_on_medium(&self) -> StorageResult<SwapOutcome> {
        let medium = self.medium()?;
        let discard = |e: io::Error| {
            if let Err(cleanup) = medium.delete(&self.staging_name) {
                warn!(path = %self.staging_name, error = %cleanup, "failed to discard staging file");
            }
            StorageError::write(&self.name, 0, e)
        };

        if medium.supports_rename_over() {
            medium
                .rename(&self.staging_name, &self.name)
                .map_err(discard)?;
            return Ok(SwapOutcome::Done);
        }

        medium.delete(&self.name).map_err(discard)?;
        // The original is gone; only the rename is left to do.
        let attempts = self.config.reopen_attempts.max(1);
        for attempt in 1..=attempts {
            match medium.rename(&self.staging_name, &self.name) {
                Ok(()) => return Ok(SwapOutcome::Done),
                Err(e) => {
                    warn!(path = %self.name, attempt, error = %e, "rename after delete failed");
                }
            }
        }
        Ok(SwapOutcome::Pending)
    }

    fn swap_in(&mut self) -> StorageResult<()> {
        self.release_handles();
        let outcome = self.swap_on_medium();
        if let Ok(done) = &outcome {
            self.pending_swap = *done == SwapOutcome::Pending;
        }
        self.reopen_handles();
        outcome.map(|_| ())
    }

    /// Rewrites the file with the range `[keep, resume_at)` replaced by `insert`.
    fn rewrite(&mut self, keep: u64, insert: &[u8], resume_at: u64) -> StorageResult<()> {
        self.flush_writer()?;
        self.stage_rewrite(keep, insert, resume_at)?;
        self.swap_in()?;
        info!(path = %self.name, keep, inserted = insert.len(), "rewrote file");
        Ok(())
    }

    fn finish_pending_swap(&mut self) -> StorageResult<()> {
        if !self.pending_swap {
            return Ok(());
        }
        self.release_handles();
        self.medium()?
            .rename(&self.staging_name, &self.name)
            .map_err(|e| StorageError::write(&self.name, 0, e))?;
        self.pending_swap = false;
        self.reopen_handles();
        info!(path = %self.name, "completed pending rewrite swap");
        Ok(())
    }
}

impl<M: Medium> StorageFile for RemoteFile<M> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        self.medium()?;
        if self.empty || offset >= self.size {
            return Err(StorageError::end_of_stream(&self.name, offset));
        }

        let want = readable_len(self.size, offset, buf.len());
        let on_medium = readable_len(self.physical, offset, want);
        if on_medium > 0 {
            self.read_physical(&mut buf[..on_medium], offset)?;
        }
        // Bytes between the physical end and the padded size read as zeros.
        buf[on_medium..want].fill(0);

        trace!(path = %self.name, offset, len = want, "read");
        Ok(want)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        self.medium()?;
        self.finish_pending_swap()?;
        self.config.alignment.check_offset(&self.name, offset)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let padded = self.config.alignment.pad(buf);
        let end = offset + padded.len() as u64;
        if offset >= self.physical {
            if let Err(e) = self.append_physical(offset - self.physical, &padded) {
                self.resync_physical();
                return Err(e);
            }
            self.physical = end;
        } else {
            self.rewrite(offset, &padded, end)?;
            self.physical = self.physical.max(end);
        }

        if end > self.size {
            self.size = end;
            self.modified = SystemTime::now();
        }
        self.empty = false;

        trace!(path = %self.name, offset, len = buf.len(), padded = padded.len(), "write");
        Ok(buf.len())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.medium()?;
        self.finish_pending_swap()?;

        if new_size >= self.size {
            // No native extend: append the zero gap.
            if new_size > self.physical {
                if let Err(e) = self.append_physical(new_size - self.physical, &[]) {
                    self.resync_physical();
                    return Err(e);
                }
                self.physical = new_size;
            }
            if new_size > self.size {
                self.empty = false;
            }
        } else {
            // No native shrink: copy the surviving prefix and swap it in.
            if new_size < self.physical {
                self.rewrite(new_size, &[], self.physical)?;
                self.physical = new_size;
            }
            if new_size == 0 {
                self.empty = true;
            }
        }

        debug!(path = %self.name, from = self.size, to = new_size, "truncated");
        self.size = new_size;
        self.modified = SystemTime::now();
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.medium()?;
        self.finish_pending_swap()?;
        self.flush_writer()
    }

    fn close(&mut self) -> StorageResult<()> {
        if self.medium.is_none() {
            return Ok(());
        }
        let flushed = self.flush_writer();
        self.release_handles();
        if self.pending_swap {
            if let Some(medium) = &self.medium {
                match medium.rename(&self.staging_name, &self.name) {
                    Ok(()) => self.pending_swap = false,
                    // The next open completes the swap.
                    Err(e) => warn!(path = %self.name, error = %e, "swap still pending at close"),
                }
            }
        }
        self.medium = None;
        debug!(path = %self.name, "closed");
        flushed
    }

    fn stat(&self) -> StorageResult<FileStat> {
        self.medium()?;
        Ok(FileStat {
            size: self.size,
            modified: self.modified,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<M: Medium> Drop for RemoteFile<M> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.name, error = %e, "error closing remote file on drop");
        }
    }
}

/// A backend adapter over a remote filesystem.
///
/// Namespace operations go through one administrative connection; every
/// opened file gets a connection of its own.
#[derive(Debug)]
pub struct RemoteBackend<C: Connector> {
    connector: C,
    admin: C::Medium,
    config: StorageConfig,
}

impl<C: Connector> RemoteBackend<C> {
    /// Connects to the remote filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConnectFailed`] if the endpoint is unreachable.
    pub fn connect(connector: C, config: &StorageConfig) -> StorageResult<Self> {
        let admin = connector.connect()?;
        info!(endpoint = %connector.endpoint(), policy = ?config.handle_policy, "connected remote backend");
        Ok(Self {
            connector,
            admin,
            config: config.clone(),
        })
    }

    /// Returns the configuration files are opened with.
    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn exists_on_admin(&self, name: &str) -> io::Result<bool> {
        Ok(self.admin.path_info(name)?.is_some())
    }
}

impl<C: Connector> Backend for RemoteBackend<C>
where
    C::Medium: 'static,
{
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageFile>> {
        let medium = self.connector.connect()?;
        let file = RemoteFile::open(medium, name, &self.config)?;
        Ok(Box::new(file))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.exists_on_admin(name)?)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        let staging = format!("{name}{STAGING_SUFFIX}");
        for path in [name, staging.as_str()] {
            if self.exists_on_admin(path)? {
                self.admin.delete(path)?;
            }
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        if !self.admin.supports_rename_over() && self.exists_on_admin(to)? {
            self.admin.delete(to)?;
        }
        self.admin.rename(from, to)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut names = self.admin.list(prefix)?;
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::{FaultPlan, MemoryFs, MemoryNamespace};
    use proptest::prelude::*;

    const POLICIES: [HandlePolicy; 2] = [HandlePolicy::PerOperation, HandlePolicy::Persistent];

    fn config(policy: HandlePolicy) -> StorageConfig {
        StorageConfig::new().handle_policy(policy).copy_chunk_size(5)
    }

    fn open(ns: &MemoryNamespace, name: &str, policy: HandlePolicy) -> RemoteFile<MemoryFs> {
        let medium = ns.connector().connect().unwrap();
        RemoteFile::open(medium, name, &config(policy)).unwrap()
    }

    fn read_all(file: &RemoteFile<MemoryFs>) -> Vec<u8> {
        let size = file.stat().unwrap().size as usize;
        let mut buf = vec![0u8; size];
        if size > 0 {
            file.read_exact_at(&mut buf, 0).unwrap();
        }
        buf
    }

    #[test]
    fn remote_write_truncate_read_scenario() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://scenario");
            let mut file = open(&ns, "v.dat", policy);

            assert_eq!(file.write_at(&[1, 2, 3, 4, 5, 6, 7, 8], 0).unwrap(), 8);
            assert_eq!(file.stat().unwrap().size, 8);

            file.truncate(4).unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4);
            assert_eq!(buf, [1, 2, 3, 4]);
            assert!(file.read_at(&mut buf, 4).unwrap_err().is_end_of_stream());
            assert_eq!(ns.file("v.dat").unwrap(), vec![1, 2, 3, 4]);
        }
    }

    #[test]
    fn remote_new_file_is_created_empty() {
        let ns = MemoryNamespace::new("mem://a");
        let file = open(&ns, "v.dat", HandlePolicy::PerOperation);
        assert_eq!(ns.file("v.dat").unwrap(), Vec::<u8>::new());

        let mut buf = [0u8; 8];
        assert!(file.read_at(&mut buf, 0).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn remote_short_write_is_padded() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);

            assert_eq!(file.write(b"abc").unwrap(), 3);
            assert_eq!(file.stat().unwrap().size, 8);
            assert_eq!(ns.file("v.dat").unwrap(), b"abc\0\0\0\0\0");
        }
    }

    #[test]
    fn remote_unaligned_offset_is_rejected() {
        let ns = MemoryNamespace::new("mem://a");
        let mut file = open(&ns, "v.dat", HandlePolicy::PerOperation);
        assert!(matches!(
            file.write_at(b"abc", 4),
            Err(StorageError::Alignment { offset: 4, unit: 8, .. })
        ));
        assert!(ns.file("v.dat").unwrap().is_empty());
    }

    #[test]
    fn remote_open_pads_unaligned_size() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            ns.put_file("v.dat", b"hello".to_vec());
            let mut file = open(&ns, "v.dat", policy);
            assert_eq!(file.stat().unwrap().size, 8);

            file.write(&[9; 8]).unwrap();
            assert_eq!(file.stat().unwrap().size, 16);
            let mut expected = b"hello\0\0\0".to_vec();
            expected.extend_from_slice(&[9; 8]);
            assert_eq!(ns.file("v.dat").unwrap(), expected);
            assert_eq!(read_all(&file), expected);
        }
    }

    #[test]
    fn remote_write_past_end_leaves_zero_gap() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);
            file.write_at(&[1; 8], 16).unwrap();

            let mut expected = vec![0u8; 16];
            expected.extend_from_slice(&[1; 8]);
            assert_eq!(read_all(&file), expected);
            assert_eq!(file.stat().unwrap().size, 24);
        }
    }

    #[test]
    fn remote_overwrite_inside_file() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);
            file.write_at(&[1; 24], 0).unwrap();
            file.write_at(&[2; 8], 8).unwrap();

            let mut expected = vec![1u8; 24];
            expected[8..16].fill(2);
            assert_eq!(read_all(&file), expected);
            assert_eq!(file.stat().unwrap().size, 24);
            assert!(ns.file("v.dat.truncating").is_none());
        }
    }

    #[test]
    fn remote_extend_writes_zero_gap() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);
            file.write(&[3; 8]).unwrap();
            file.truncate(13).unwrap();

            assert_eq!(file.stat().unwrap().size, 13);
            let mut expected = vec![3u8; 8];
            expected.extend_from_slice(&[0; 5]);
            assert_eq!(ns.file("v.dat").unwrap(), expected);
        }
    }

    #[test]
    fn remote_truncate_to_zero_is_empty() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);
            file.write(&[3; 16]).unwrap();
            file.truncate(0).unwrap();

            let mut buf = [0u8; 1];
            assert!(file.read_at(&mut buf, 0).unwrap_err().is_end_of_stream());
            assert_eq!(file.stat().unwrap().size, 0);

            file.write(&[4; 8]).unwrap();
            assert_eq!(read_all(&file), vec![4; 8]);
        }
    }

    #[test]
    fn remote_failed_shrink_leaves_original_usable() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);
            file.write(&[5; 32]).unwrap();

            ns.set_faults(FaultPlan::new().fail_writes_after(8).on_paths(STAGING_SUFFIX));
            assert!(matches!(
                file.truncate(16),
                Err(StorageError::Write { .. })
            ));
            ns.clear_faults();

            assert_eq!(file.stat().unwrap().size, 32);
            assert_eq!(read_all(&file), vec![5; 32]);
            assert!(ns.file("v.dat.truncating").is_none());

            file.write(&[6; 8]).unwrap();
            assert_eq!(file.stat().unwrap().size, 40);
        }
    }

    #[test]
    fn remote_failed_append_retry_lands_at_offset() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);
            file.write_at(&[1; 8], 0).unwrap();

            // The zero gap reaches the medium, the data does not.
            ns.set_faults(FaultPlan::new().fail_writes_after(8));
            assert!(matches!(
                file.write_at(&[2; 8], 16),
                Err(StorageError::Write { .. })
            ));
            ns.clear_faults();
            assert_eq!(file.stat().unwrap().size, 8);

            file.write_at(&[2; 8], 16).unwrap();
            assert_eq!(file.stat().unwrap().size, 24);
            assert_eq!(ns.file("v.dat").unwrap().len(), 24);

            let mut buf = [0u8; 8];
            file.read_exact_at(&mut buf, 16).unwrap();
            assert_eq!(buf, [2; 8], "policy {policy:?}");
            let mut expected = vec![1; 8];
            expected.extend_from_slice(&[0; 8]);
            expected.extend_from_slice(&[2; 8]);
            assert_eq!(read_all(&file), expected);
        }
    }

    #[test]
    fn remote_failed_staging_sync_leaves_original() {
        let ns = MemoryNamespace::new("mem://a");
        let mut file = open(&ns, "v.dat", HandlePolicy::PerOperation);
        file.write(&[5; 16]).unwrap();

        ns.set_faults(FaultPlan::new().fail_syncs(1).on_paths(STAGING_SUFFIX));
        assert!(file.truncate(8).is_err());
        assert_eq!(ns.file("v.dat").unwrap(), vec![5; 16]);
        assert!(ns.file("v.dat.truncating").is_none());
    }

    #[test]
    fn remote_failed_delete_leaves_original() {
        let ns = MemoryNamespace::new("mem://a");
        let mut file = open(&ns, "v.dat", HandlePolicy::Persistent);
        file.write(&[5; 16]).unwrap();

        ns.set_faults(FaultPlan::new().fail_deletes(1).on_paths("v.dat"));
        assert!(file.truncate(8).is_err());
        ns.clear_faults();

        assert_eq!(read_all(&file), vec![5; 16]);
    }

    #[test]
    fn remote_rename_failure_after_delete_completes_later() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);
            file.write(&[7; 24]).unwrap();

            ns.set_faults(FaultPlan::new().fail_renames(3));
            file.truncate(8).unwrap();
            ns.clear_faults();

            // The data lives in the staging file until the swap completes.
            assert!(ns.file("v.dat").is_none());
            assert_eq!(read_all(&file), vec![7; 8]);

            file.write(&[8; 8]).unwrap();
            assert!(ns.file("v.dat.truncating").is_none());
            let mut expected = vec![7u8; 8];
            expected.extend_from_slice(&[8; 8]);
            assert_eq!(ns.file("v.dat").unwrap(), expected);
        }
    }

    #[test]
    fn remote_open_completes_interrupted_swap() {
        let ns = MemoryNamespace::new("mem://a");
        ns.put_file("v.dat.truncating", vec![1; 8]);
        let file = open(&ns, "v.dat", HandlePolicy::PerOperation);
        assert_eq!(read_all(&file), vec![1; 8]);
        assert!(ns.file("v.dat.truncating").is_none());
    }

    #[test]
    fn remote_open_discards_stale_staging_file() {
        let ns = MemoryNamespace::new("mem://a");
        ns.put_file("v.dat", vec![2; 16]);
        ns.put_file("v.dat.truncating", vec![1; 8]);
        let file = open(&ns, "v.dat", HandlePolicy::PerOperation);
        assert_eq!(read_all(&file), vec![2; 16]);
        assert!(ns.file("v.dat.truncating").is_none());
    }

    #[test]
    fn remote_persistent_reopens_stale_reader() {
        let ns = MemoryNamespace::new("mem://a");
        let mut file = open(&ns, "v.dat", HandlePolicy::Persistent);
        file.write(&[1; 8]).unwrap();
        file.sync().unwrap();
        let mut buf = [0u8; 8];
        file.read_exact_at(&mut buf, 0).unwrap();

        // Replace the file behind the handle's back with identical bytes.
        ns.put_file("v.dat", vec![1; 8]);
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [1; 8]);
    }

    #[test]
    fn remote_persistent_reuses_handles() {
        let per_op = MemoryNamespace::new("mem://a");
        let persistent = MemoryNamespace::new("mem://b");
        for (ns, policy) in [
            (&per_op, HandlePolicy::PerOperation),
            (&persistent, HandlePolicy::Persistent),
        ] {
            let mut file = open(ns, "v.dat", policy);
            file.write(&[1; 8]).unwrap();
            let mut buf = [0u8; 8];
            for _ in 0..10 {
                file.read_exact_at(&mut buf, 0).unwrap();
            }
        }
        assert!(persistent.handles_opened() < per_op.handles_opened());
    }

    #[test]
    fn remote_close_twice_and_use_after_close() {
        for policy in POLICIES {
            let ns = MemoryNamespace::new("mem://a");
            let mut file = open(&ns, "v.dat", policy);
            file.write(&[1; 8]).unwrap();
            file.close().unwrap();
            file.close().unwrap();

            let mut buf = [0u8; 8];
            assert!(matches!(file.read_at(&mut buf, 0), Err(StorageError::Closed { .. })));
            assert!(matches!(file.stat(), Err(StorageError::Closed { .. })));
            assert!(matches!(file.truncate(0), Err(StorageError::Closed { .. })));
            assert_eq!(file.name(), "v.dat");
        }
    }

    #[test]
    fn remote_backend_connect_failure_is_fatal() {
        let ns = MemoryNamespace::new("mem://down");
        ns.set_available(false);
        let err = RemoteBackend::connect(ns.connector(), &StorageConfig::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn remote_backend_files_get_own_connections() {
        let ns = MemoryNamespace::new("mem://a");
        let backend = RemoteBackend::connect(ns.connector(), &StorageConfig::default()).unwrap();
        let _a = backend.open("1.g0.dat").unwrap();
        let _b = backend.open("2.g0.dat").unwrap();
        assert_eq!(ns.connection_count(), 3);
    }

    #[test]
    fn remote_backend_rename_replaces_destination() {
        let ns = MemoryNamespace::new("mem://a");
        ns.put_file("a", vec![1]);
        ns.put_file("b", vec![2]);
        let backend = RemoteBackend::connect(ns.connector(), &StorageConfig::default()).unwrap();

        backend.rename("a", "b").unwrap();
        assert_eq!(ns.file("b").unwrap(), vec![1]);
        assert!(!backend.exists("a").unwrap());

        backend.remove("b").unwrap();
        backend.remove("b").unwrap();
        assert!(backend.list("").unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn remote_writes_match_model(
            writes in prop::collection::vec((0u64..8, prop::collection::vec(any::<u8>(), 1..20)), 1..12),
            persistent in any::<bool>(),
        ) {
            let policy = if persistent { HandlePolicy::Persistent } else { HandlePolicy::PerOperation };
            let ns = MemoryNamespace::new("mem://prop");
            let mut file = open(&ns, "v.dat", policy);
            let mut model: Vec<u8> = Vec::new();
            let mut max_end = 0u64;

            for (slot, data) in &writes {
                let offset = slot * 8;
                prop_assert_eq!(file.write_at(data, offset).unwrap(), data.len());

                let padded_len = data.len().div_ceil(8) * 8;
                let end = offset as usize + padded_len;
                if model.len() < end {
                    model.resize(end, 0);
                }
                model[offset as usize..offset as usize + data.len()].copy_from_slice(data);
                model[offset as usize + data.len()..end].fill(0);
                max_end = max_end.max(end as u64);
            }

            prop_assert_eq!(file.stat().unwrap().size, max_end);
            prop_assert_eq!(read_all(&file), model);
        }
    }
}
