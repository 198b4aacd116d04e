//! Local disk backend.

use crate::backend::{Backend, BackendKind};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::file::{readable_len, Alignment, FileStat, StorageFile};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace};

/// A storage file on a local filesystem.
///
/// The file keeps one persistent OS handle for its lifetime. Local disks
/// support positional writes and native truncation, so no copy is needed
/// to shrink.
///
/// # Durability
///
/// - `write_at()` pushes data to the OS
/// - `sync()` calls `File::sync_all()` to ensure data is on disk
///
/// # Example
///
/// ```no_run
/// use volstore_storage::{Alignment, DiskFile, StorageFile};
/// use std::path::Path;
///
/// let mut file = DiskFile::open(Path::new("1.g0.dat"), Alignment::DEFAULT).unwrap();
/// file.write_at(&[1, 2, 3, 4, 5, 6, 7, 8], 0).unwrap();
/// file.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct DiskFile {
    name: String,
    file: Mutex<Option<File>>,
    size: u64,
    modified: SystemTime,
    empty: bool,
    alignment: Alignment,
}

impl DiskFile {
    /// Opens or creates a disk file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConnectFailed`] if the file cannot be opened or created.
    pub fn open(path: &Path, alignment: Alignment) -> StorageResult<Self> {
        let name = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::connect_failed(&name, e))?;

        let metadata = file
            .metadata()
            .map_err(|e| StorageError::connect_failed(&name, e))?;
        let physical = metadata.len();
        let size = alignment.align_up(physical);
        if size != physical {
            debug!(path = %name, physical, size, "padded file size to alignment");
        }

        Ok(Self {
            name,
            file: Mutex::new(Some(file)),
            size,
            modified: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            empty: physical == 0,
            alignment,
        })
    }

    fn closed(&self) -> StorageError {
        StorageError::closed(&self.name)
    }
}

impl StorageFile for DiskFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(|| self.closed())?;

        if self.empty || offset >= self.size {
            return Err(StorageError::end_of_stream(&self.name, offset));
        }

        let want = readable_len(self.size, offset, buf.len());
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::seek(&self.name, offset, e))?;

        let mut filled = 0;
        while filled < want {
            match file.read(&mut buf[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(StorageError::read(&self.name, offset, e)),
            }
        }
        // Bytes between the physical end and the padded size read as zeros.
        buf[filled..want].fill(0);

        trace!(path = %self.name, offset, len = want, "read");
        Ok(want)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| StorageError::closed(&self.name))?;

        self.alignment.check_offset(&self.name, offset)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let padded = self.alignment.pad(buf);
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::seek(&self.name, offset, e))?;
        file.write_all(&padded)
            .map_err(|e| StorageError::write(&self.name, offset, e))?;

        let end = offset + padded.len() as u64;
        if end > self.size {
            self.size = end;
            self.modified = SystemTime::now();
        }
        self.empty = false;

        trace!(path = %self.name, offset, len = buf.len(), padded = padded.len(), "write");
        Ok(buf.len())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let guard = self.file.lock();
        let file = guard
            .as_ref()
            .ok_or_else(|| StorageError::closed(&self.name))?;

        file.set_len(new_size)
            .map_err(|e| StorageError::write(&self.name, new_size, e))?;
        file.sync_all()
            .map_err(|e| StorageError::write(&self.name, new_size, e))?;

        debug!(path = %self.name, from = self.size, to = new_size, "truncated");
        self.size = new_size;
        self.modified = SystemTime::now();
        self.empty = new_size == 0;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let guard = self.file.lock();
        let file = guard.as_ref().ok_or_else(|| self.closed())?;
        file.sync_all()
            .map_err(|e| StorageError::write(&self.name, self.size, e))
    }

    fn close(&mut self) -> StorageResult<()> {
        if let Some(file) = self.file.lock().take() {
            file.sync_all()
                .map_err(|e| StorageError::write(&self.name, self.size, e))?;
            debug!(path = %self.name, "closed");
        }
        Ok(())
    }

    fn stat(&self) -> StorageResult<FileStat> {
        if self.file.lock().is_none() {
            return Err(self.closed());
        }
        Ok(FileStat {
            size: self.size,
            modified: self.modified,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A backend adapter over one local directory.
#[derive(Debug)]
pub struct DiskBackend {
    root: PathBuf,
    alignment: Alignment,
}

impl DiskBackend {
    /// Opens a disk backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ConnectFailed`] if the directory cannot be created.
    pub fn open(root: &Path, config: &StorageConfig) -> StorageResult<Self> {
        fs::create_dir_all(root)
            .map_err(|e| StorageError::connect_failed(root.display().to_string(), e))?;
        Ok(Self {
            root: root.to_path_buf(),
            alignment: config.alignment,
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Syncs the root directory so renames and removals are durable.
    #[cfg(unix)]
    fn sync_directory(&self) -> io::Result<()> {
        File::open(&self.root)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> io::Result<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

impl Backend for DiskBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageFile>> {
        let file = DiskFile::open(&self.root.join(name), self.alignment)?;
        Ok(Box::new(file))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.root.join(name).exists())
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        match fs::remove_file(self.root.join(name)) {
            Ok(()) => {
                self.sync_directory()?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        fs::rename(self.root.join(from), self.root.join(to))?;
        self.sync_directory()?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn reserve(&self, bytes: u64) -> StorageResult<()> {
        let available = fs2::available_space(&self.root)?;
        if bytes > available {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "cannot reserve {bytes} bytes under {}: only {available} available",
                    self.root.display()
                ),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_file(dir: &Path) -> DiskFile {
        DiskFile::open(&dir.join("test.dat"), Alignment::DEFAULT).unwrap()
    }

    #[test]
    fn disk_create_new_is_empty() {
        let dir = tempdir().unwrap();
        let file = open_file(dir.path());
        assert_eq!(file.stat().unwrap().size, 0);
        assert!(dir.path().join("test.dat").exists());
    }

    #[test]
    fn disk_read_empty_is_end_of_stream() {
        let dir = tempdir().unwrap();
        let file = open_file(dir.path());
        let mut buf = [0u8; 4];
        assert!(matches!(
            file.read_at(&mut buf, 0),
            Err(StorageError::EndOfStream { offset: 0, .. })
        ));
    }

    #[test]
    fn disk_write_and_read() {
        let dir = tempdir().unwrap();
        let mut file = open_file(dir.path());

        assert_eq!(file.write_at(b"hello world!", 0).unwrap(), 12);
        assert_eq!(file.stat().unwrap().size, 16);

        let mut buf = [0u8; 12];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello world!");
    }

    #[test]
    fn disk_unaligned_write_fails() {
        let dir = tempdir().unwrap();
        let mut file = open_file(dir.path());
        assert!(matches!(
            file.write_at(b"x", 3),
            Err(StorageError::Alignment { offset: 3, .. })
        ));
    }

    #[test]
    fn disk_reopen_pads_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dat");
        fs::write(&path, b"hello").unwrap();

        let file = DiskFile::open(&path, Alignment::DEFAULT).unwrap();
        assert_eq!(file.stat().unwrap().size, 8);

        let mut buf = [0xffu8; 8];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 8);
        assert_eq!(&buf, b"hello\0\0\0");
    }

    #[test]
    fn disk_shrink_keeps_prefix() {
        let dir = tempdir().unwrap();
        let mut file = open_file(dir.path());
        file.write_at(&[1, 2, 3, 4, 5, 6, 7, 8], 0).unwrap();
        assert_eq!(file.stat().unwrap().size, 8);

        file.truncate(4).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(file.read_at(&mut buf, 4).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn disk_extend_fills_zeros() {
        let dir = tempdir().unwrap();
        let mut file = open_file(dir.path());
        file.write_at(&[7; 8], 0).unwrap();
        file.truncate(20).unwrap();

        let mut buf = [0xffu8; 12];
        file.read_exact_at(&mut buf, 8).unwrap();
        assert_eq!(buf, [0; 12]);
        assert_eq!(file.stat().unwrap().size, 20);
    }

    #[test]
    fn disk_truncate_to_zero_is_empty() {
        let dir = tempdir().unwrap();
        let mut file = open_file(dir.path());
        file.write_at(&[7; 8], 0).unwrap();
        file.truncate(0).unwrap();

        let mut buf = [0u8; 1];
        assert!(file.read_at(&mut buf, 0).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn disk_close_twice_and_use_after_close() {
        let dir = tempdir().unwrap();
        let mut file = open_file(dir.path());
        file.close().unwrap();
        file.close().unwrap();

        assert!(matches!(file.stat(), Err(StorageError::Closed { .. })));
        assert!(matches!(
            file.write_at(&[0; 8], 0),
            Err(StorageError::Closed { .. })
        ));
    }

    #[test]
    fn disk_backend_namespace_operations() {
        let dir = tempdir().unwrap();
        let backend = DiskBackend::open(dir.path(), &StorageConfig::default()).unwrap();

        let mut file = backend.open("1.g0.dat").unwrap();
        file.write(&[1; 8]).unwrap();
        file.close().unwrap();

        assert!(backend.exists("1.g0.dat").unwrap());
        backend.rename("1.g0.dat", "1.g1.dat").unwrap();
        assert_eq!(backend.list("1.").unwrap(), vec!["1.g1.dat".to_string()]);

        backend.remove("1.g1.dat").unwrap();
        backend.remove("1.g1.dat").unwrap();
        assert!(backend.list("1.").unwrap().is_empty());
    }

    #[test]
    fn disk_backend_reserve_rejects_absurd_hint() {
        let dir = tempdir().unwrap();
        let backend = DiskBackend::open(dir.path(), &StorageConfig::default()).unwrap();
        assert!(backend.reserve(0).is_ok());
        assert!(backend.reserve(u64::MAX).is_err());
    }
}
