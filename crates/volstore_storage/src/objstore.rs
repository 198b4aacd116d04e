//! Object storage used by the archival tier.
//!
//! [`ObjectStore`] is the narrow multipart-capable surface the archival
//! backend and the uploader need. Two stores are provided: an in-process
//! [`MemoryObjectStore`] with fault injection, and a [`DirObjectStore`]
//! that keeps objects as plain files under a root directory.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

/// Where an object lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    /// Bucket name.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
}

impl ObjectLocation {
    /// Creates a location.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Length in bytes.
    pub size: u64,
    /// Storage class the object was written with, if any.
    pub storage_class: Option<String>,
    /// Time the object was completed.
    pub modified: SystemTime,
}

/// A part accepted by the store during a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    /// One-based part number.
    pub number: u32,
    /// Store-assigned tag of the part.
    pub etag: String,
    /// Length of the part in bytes.
    pub size: u64,
}

/// A cold object storage service.
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Returns metadata for an object, or `None` if it does not exist.
    fn head(&self, location: &ObjectLocation) -> io::Result<Option<ObjectInfo>>;

    /// Reads up to `buf.len()` bytes starting at `offset`.
    fn get_range(&self, location: &ObjectLocation, offset: u64, buf: &mut [u8])
        -> io::Result<usize>;

    /// Starts a multipart upload and returns its id.
    fn create_multipart(
        &self,
        location: &ObjectLocation,
        storage_class: Option<&str>,
    ) -> io::Result<String>;

    /// Uploads one part of a multipart upload.
    fn upload_part(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        number: u32,
        data: &[u8],
    ) -> io::Result<CompletedPart>;

    /// Assembles the parts, in the order given, into the object.
    fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> io::Result<()>;

    /// Discards a multipart upload and its parts.
    fn abort_multipart(&self, location: &ObjectLocation, upload_id: &str) -> io::Result<()>;

    /// Deletes an object. Deleting a missing object succeeds.
    fn delete(&self, location: &ObjectLocation) -> io::Result<()>;

    /// Lists keys in `bucket` starting with `prefix`, sorted.
    fn list(&self, bucket: &str, prefix: &str) -> io::Result<Vec<String>>;
}

fn no_such_upload(upload_id: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no multipart upload {upload_id}"),
    )
}

fn part_etag(data: &[u8]) -> String {
    format!("{:08x}", crc32c::crc32c(data))
}

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    storage_class: Option<String>,
    modified: SystemTime,
}

#[derive(Debug)]
struct PendingUpload {
    location: ObjectLocation,
    storage_class: Option<String>,
    parts: BTreeMap<u32, Vec<u8>>,
}

/// An in-process object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    fail_parts_after: Mutex<Option<u64>>,
    parts_uploaded: AtomicU64,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `parts` more part uploads, then fails every one after.
    pub fn fail_parts_after(&self, parts: u64) {
        *self.fail_parts_after.lock() = Some(parts);
    }

    /// Returns the content of a completed object.
    #[must_use]
    pub fn object(&self, location: &ObjectLocation) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .get(&(location.bucket.clone(), location.key.clone()))
            .map(|o| o.data.clone())
    }

    /// Seeds a completed object.
    pub fn put_object(&self, location: &ObjectLocation, data: Vec<u8>) {
        self.objects.lock().insert(
            (location.bucket.clone(), location.key.clone()),
            StoredObject {
                data,
                storage_class: None,
                modified: SystemTime::now(),
            },
        );
    }

    /// Returns the number of multipart uploads neither completed nor aborted.
    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Returns the number of parts accepted so far.
    #[must_use]
    pub fn parts_uploaded(&self) -> u64 {
        self.parts_uploaded.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn head(&self, location: &ObjectLocation) -> io::Result<Option<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .get(&(location.bucket.clone(), location.key.clone()))
            .map(|o| ObjectInfo {
                size: o.data.len() as u64,
                storage_class: o.storage_class.clone(),
                modified: o.modified,
            }))
    }

    fn get_range(
        &self,
        location: &ObjectLocation,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let objects = self.objects.lock();
        let object = objects
            .get(&(location.bucket.clone(), location.key.clone()))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no object {location}"))
            })?;
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(object.data.len());
        let n = buf.len().min(object.data.len() - start);
        buf[..n].copy_from_slice(&object.data[start..start + n]);
        Ok(n)
    }

    fn create_multipart(
        &self,
        location: &ObjectLocation,
        storage_class: Option<&str>,
    ) -> io::Result<String> {
        let id = Uuid::new_v4().to_string();
        self.uploads.lock().insert(
            id.clone(),
            PendingUpload {
                location: location.clone(),
                storage_class: storage_class.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn upload_part(
        &self,
        _location: &ObjectLocation,
        upload_id: &str,
        number: u32,
        data: &[u8],
    ) -> io::Result<CompletedPart> {
        {
            let mut budget = self.fail_parts_after.lock();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("injected failure on part {number}"),
                    ));
                }
                *left -= 1;
            }
        }

        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        upload.parts.insert(number, data.to_vec());
        self.parts_uploaded.fetch_add(1, Ordering::SeqCst);
        Ok(CompletedPart {
            number,
            etag: part_etag(data),
            size: data.len() as u64,
        })
    }

    fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> io::Result<()> {
        let upload = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;

        let mut data = Vec::new();
        for part in parts {
            let bytes = upload.parts.get(&part.number).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("part {} was never uploaded", part.number),
                )
            })?;
            if part_etag(bytes) != part.etag {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("part {} etag mismatch", part.number),
                ));
            }
            data.extend_from_slice(bytes);
        }

        self.objects.lock().insert(
            (location.bucket.clone(), location.key.clone()),
            StoredObject {
                data,
                storage_class: upload.storage_class,
                modified: SystemTime::now(),
            },
        );
        debug!(location = %upload.location, parts = parts.len(), "completed multipart upload");
        Ok(())
    }

    fn abort_multipart(&self, _location: &ObjectLocation, upload_id: &str) -> io::Result<()> {
        self.uploads.lock().remove(upload_id);
        Ok(())
    }

    fn delete(&self, location: &ObjectLocation) -> io::Result<()> {
        self.objects
            .lock()
            .remove(&(location.bucket.clone(), location.key.clone()));
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> io::Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }
}

const UPLOADS_DIR: &str = ".uploads";
const CLASSES_DIR: &str = ".classes";
const TARGET_FILE: &str = "target";

/// An object store kept as plain files under a root directory.
///
/// Objects live at `<root>/<bucket>/<key>`. In-flight multipart uploads
/// are staged under `<root>/.uploads/<id>/` and moved into place by a
/// rename on completion.
#[derive(Debug)]
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(UPLOADS_DIR))?;
        Ok(Self { root })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, location: &ObjectLocation) -> PathBuf {
        self.root.join(&location.bucket).join(&location.key)
    }

    fn class_path(&self, location: &ObjectLocation) -> PathBuf {
        self.root
            .join(CLASSES_DIR)
            .join(&location.bucket)
            .join(&location.key)
    }

    fn upload_dir(&self, upload_id: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(UPLOADS_DIR).join(upload_id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(no_such_upload(upload_id))
        }
    }

    fn walk(dir: &Path, base: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::walk(&path, base, out)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

fn part_file(number: u32) -> String {
    format!("part-{number:05}")
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

impl ObjectStore for DirObjectStore {
    fn head(&self, location: &ObjectLocation) -> io::Result<Option<ObjectInfo>> {
        let metadata = match fs::metadata(self.object_path(location)) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let storage_class = match fs::read_to_string(self.class_path(location)) {
            Ok(class) => Some(class),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        Ok(Some(ObjectInfo {
            size: metadata.len(),
            storage_class,
            modified: metadata.modified()?,
        }))
    }

    fn get_range(
        &self,
        location: &ObjectLocation,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let mut file = File::open(self.object_path(location))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn create_multipart(
        &self,
        location: &ObjectLocation,
        storage_class: Option<&str>,
    ) -> io::Result<String> {
        let id = Uuid::new_v4().to_string();
        let dir = self.root.join(UPLOADS_DIR).join(&id);
        fs::create_dir_all(&dir)?;
        let target = format!(
            "{}\n{}\n{}",
            location.bucket,
            location.key,
            storage_class.unwrap_or_default()
        );
        fs::write(dir.join(TARGET_FILE), target)?;
        Ok(id)
    }

    fn upload_part(
        &self,
        _location: &ObjectLocation,
        upload_id: &str,
        number: u32,
        data: &[u8],
    ) -> io::Result<CompletedPart> {
        let dir = self.upload_dir(upload_id)?;
        let mut file = File::create(dir.join(part_file(number)))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(CompletedPart {
            number,
            etag: part_etag(data),
            size: data.len() as u64,
        })
    }

    fn complete_multipart(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> io::Result<()> {
        let dir = self.upload_dir(upload_id)?;
        let assembled_path = dir.join("assembled");
        let mut assembled = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&assembled_path)?;
        for part in parts {
            let bytes = fs::read(dir.join(part_file(part.number)))?;
            if part_etag(&bytes) != part.etag {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("part {} etag mismatch", part.number),
                ));
            }
            assembled.write_all(&bytes)?;
        }
        assembled.sync_all()?;
        drop(assembled);

        let target = fs::read_to_string(dir.join(TARGET_FILE))?;
        let storage_class = target.lines().nth(2).filter(|c| !c.is_empty());

        let destination = self.object_path(location);
        ensure_parent(&destination)?;
        fs::rename(&assembled_path, &destination)?;
        if let Some(class) = storage_class {
            let class_path = self.class_path(location);
            ensure_parent(&class_path)?;
            fs::write(class_path, class)?;
        }
        fs::remove_dir_all(&dir)?;
        debug!(location = %location, parts = parts.len(), "completed multipart upload");
        Ok(())
    }

    fn abort_multipart(&self, _location: &ObjectLocation, upload_id: &str) -> io::Result<()> {
        match fs::remove_dir_all(self.root.join(UPLOADS_DIR).join(upload_id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn delete(&self, location: &ObjectLocation) -> io::Result<()> {
        for path in [self.object_path(location), self.class_path(location)] {
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        Ok(())
    }

    fn list(&self, bucket: &str, prefix: &str) -> io::Result<Vec<String>> {
        let base = self.root.join(bucket);
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        Self::walk(&base, &base, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
