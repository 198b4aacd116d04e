//! Multipart upload of a volume file into archival storage.
//!
//! Part size starts at the configured minimum and grows geometrically
//! until the whole file fits within the part bound. Parts are uploaded by
//! a fixed pool of scoped worker threads reading the source concurrently.
//! Progress is reported after every completed part; if the callback
//! returns an error the transfer is cancelled and the upload aborted.

use crate::config::UploadConfig;
use crate::error::{StorageError, StorageResult};
use crate::file::StorageFile;
use crate::objstore::{CompletedPart, ObjectLocation, ObjectStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Returns the part size used for a file of `file_size` bytes.
///
/// Starting from `min_part_size`, the size is multiplied by the growth
/// factor while `part_size * max_parts < file_size`.
#[must_use]
pub fn compute_part_size(file_size: u64, config: &UploadConfig) -> u64 {
    let growth = config.part_growth_factor.max(2);
    let mut part_size = config.min_part_size.max(1);
    while part_size.saturating_mul(config.max_parts) < file_size {
        part_size = part_size.saturating_mul(growth);
    }
    part_size
}

/// Outcome of a successful transfer.
///
/// Failed transfers report their partial state in
/// [`StorageError::UploadFailed`] instead.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    /// Where the object was stored.
    pub location: ObjectLocation,
    /// Bytes transferred.
    pub size: u64,
    /// Part size used.
    pub part_size: u64,
    /// Number of parts.
    pub parts: usize,
    /// Last percentage passed to the progress callback.
    pub last_percentage: f32,
}

/// One transfer request.
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Destination of the object.
    pub destination: ObjectLocation,
    /// Storage class to request, e.g. `"GLACIER"`.
    pub storage_class: Option<String>,
}

impl UploadJob {
    /// Creates a job for `bucket`/`key` with the store's default class.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            destination: ObjectLocation::new(bucket, key),
            storage_class: None,
        }
    }

    /// Requests a storage class.
    #[must_use]
    pub fn storage_class(mut self, class: impl Into<String>) -> Self {
        self.storage_class = Some(class.into());
        self
    }
}

#[derive(Debug, Default)]
struct TransferState {
    next_part: u64,
    transferred: u64,
    last_percentage: f32,
    completed: Vec<CompletedPart>,
    failure: Option<String>,
}

/// Moves sealed volume files into an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ArchivalUploader {
    store: Arc<dyn ObjectStore>,
    config: UploadConfig,
}

impl ArchivalUploader {
    /// Creates an uploader.
    pub fn new(store: Arc<dyn ObjectStore>, config: UploadConfig) -> Self {
        Self { store, config }
    }

    /// Uploads the whole of `source` as described by `job`.
    ///
    /// `progress` is called with the bytes transferred so far and the
    /// percentage complete. Calls are serialized and the byte count never
    /// decreases.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UploadFailed`] if any part fails, the
    /// callback cancels, or the store rejects the assembly. The partial
    /// upload is aborted; there is no resume.
    pub fn upload<F>(
        &self,
        source: &dyn StorageFile,
        job: &UploadJob,
        progress: F,
    ) -> StorageResult<UploadReport>
    where
        F: FnMut(u64, f32) -> Result<(), String> + Send,
    {
        let location = &job.destination;
        let failed = |transferred: u64, parts: usize, reason: String| StorageError::UploadFailed {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            bytes_transferred: transferred,
            parts_completed: parts,
            reason,
        };

        let size = source.stat()?.size;
        let part_size = compute_part_size(size, &self.config);
        // An empty source still produces one (empty) part.
        let part_count = size.div_ceil(part_size).max(1);
        let workers = usize::try_from(part_count)
            .unwrap_or(usize::MAX)
            .min(self.config.concurrency.max(1));

        let upload_id = self
            .store
            .create_multipart(location, job.storage_class.as_deref())
            .map_err(|e| failed(0, 0, e.to_string()))?;
        info!(
            location = %location,
            size,
            part_size,
            parts = part_count,
            workers,
            "starting archival upload"
        );

        let state = Mutex::new(TransferState::default());
        let progress = Mutex::new(progress);
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    self.run_worker(
                        source, location, &upload_id, size, part_size, part_count, &state,
                        &progress,
                    );
                });
            }
        });

        let TransferState {
            transferred,
            last_percentage,
            mut completed,
            failure,
            ..
        } = state.into_inner();

        if let Some(reason) = failure {
            self.abort(location, &upload_id);
            warn!(location = %location, transferred, reason = %reason, "archival upload failed");
            return Err(failed(transferred, completed.len(), reason));
        }

        completed.sort_by_key(|p| p.number);
        if let Err(e) = self
            .store
            .complete_multipart(location, &upload_id, &completed)
        {
            self.abort(location, &upload_id);
            return Err(failed(transferred, completed.len(), e.to_string()));
        }

        info!(location = %location, size, parts = completed.len(), "archival upload complete");
        Ok(UploadReport {
            location: location.clone(),
            size,
            part_size,
            parts: completed.len(),
            last_percentage,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn run_worker<F>(
        &self,
        source: &dyn StorageFile,
        location: &ObjectLocation,
        upload_id: &str,
        size: u64,
        part_size: u64,
        part_count: u64,
        state: &Mutex<TransferState>,
        progress: &Mutex<F>,
    ) where
        F: FnMut(u64, f32) -> Result<(), String> + Send,
    {
        loop {
            let index = {
                let mut state = state.lock();
                if state.failure.is_some() || state.next_part >= part_count {
                    return;
                }
                state.next_part += 1;
                state.next_part - 1
            };

            let offset = index * part_size;
            let len = part_size.min(size - offset);
            let result = self.upload_part(source, location, upload_id, index, offset, len);

            let mut state = state.lock();
            match result {
                Ok(part) => {
                    state.transferred += part.size;
                    state.completed.push(part);
                    let percentage = if size == 0 {
                        100.0
                    } else {
                        (state.transferred as f64 / size as f64 * 100.0) as f32
                    };
                    state.last_percentage = percentage;
                    // Reported under the state lock so counts arrive in order.
                    let mut callback = progress.lock();
                    if let Err(reason) = (*callback)(state.transferred, percentage) {
                        state
                            .failure
                            .get_or_insert(format!("cancelled by progress callback: {reason}"));
                    }
                }
                Err(reason) => {
                    state.failure.get_or_insert(reason);
                }
            }
        }
    }

    fn upload_part(
        &self,
        source: &dyn StorageFile,
        location: &ObjectLocation,
        upload_id: &str,
        index: u64,
        offset: u64,
        len: u64,
    ) -> Result<CompletedPart, String> {
        let number = u32::try_from(index + 1).map_err(|_| format!("part {} out of range", index + 1))?;
        let len = usize::try_from(len).map_err(|_| format!("part {number} too large"))?;

        let mut buf = vec![0u8; len];
        if len > 0 {
            source
                .read_exact_at(&mut buf, offset)
                .map_err(|e| format!("reading part {number}: {e}"))?;
        }
        let part = self
            .store
            .upload_part(location, upload_id, number, &buf)
            .map_err(|e| format!("uploading part {number}: {e}"))?;
        debug!(location = %location, part = number, bytes = len, "uploaded part");
        Ok(part)
    }

    fn abort(&self, location: &ObjectLocation, upload_id: &str) {
        if let Err(e) = self.store.abort_multipart(location, upload_id) {
            warn!(location = %location, error = %e, "failed to abort multipart upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskFile;
    use crate::file::Alignment;
    use crate::objstore::MemoryObjectStore;
    use tempfile::tempdir;

    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;

    fn source_with(data: &[u8]) -> (tempfile::TempDir, DiskFile) {
        let dir = tempdir().unwrap();
        let mut file = DiskFile::open(&dir.path().join("src.dat"), Alignment::DEFAULT).unwrap();
        if !data.is_empty() {
            file.write_at(data, 0).unwrap();
        }
        (dir, file)
    }

    fn small_parts() -> UploadConfig {
        UploadConfig::new().min_part_size(16).max_parts(1000).concurrency(3)
    }

    #[test]
    fn upload_part_size_default_for_ten_gib() {
        let config = UploadConfig::default();
        let part = compute_part_size(10 * GIB, &config);
        assert_eq!(part, 64 * MIB);
        assert!((10 * GIB).div_ceil(part) <= 1000);
    }

    #[test]
    fn upload_part_size_grows_by_factor_four() {
        let config = UploadConfig::default();
        assert_eq!(compute_part_size(0, &config), 64 * MIB);
        assert_eq!(compute_part_size(64_000 * MIB, &config), 64 * MIB);
        assert_eq!(compute_part_size(64_000 * MIB + 1, &config), 256 * MIB);
        assert_eq!(compute_part_size(1024 * GIB, &config), 4 * GIB);
        for size in [GIB, 100 * GIB, 5000 * GIB] {
            assert!(size.div_ceil(compute_part_size(size, &config)) <= 1000);
        }
    }

    #[test]
    fn upload_transfers_whole_file() {
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let (_dir, file) = source_with(&data);
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = ArchivalUploader::new(store.clone(), small_parts());

        let job = UploadJob::new("cold", "1.g0.dat").storage_class("GLACIER");
        let report = uploader.upload(&file, &job, |_, _| Ok(())).unwrap();

        assert_eq!(report.size, 200);
        assert_eq!(report.part_size, 16);
        assert_eq!(report.parts, 13);
        assert_eq!(report.last_percentage, 100.0);
        assert_eq!(store.object(&job.destination).unwrap(), data);
        let info = store.head(&job.destination).unwrap().unwrap();
        assert_eq!(info.storage_class.as_deref(), Some("GLACIER"));
    }

    #[test]
    fn upload_progress_is_monotonic_and_complete() {
        let (_dir, file) = source_with(&[7u8; 160]);
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = ArchivalUploader::new(store, small_parts());

        let mut seen = Vec::new();
        uploader
            .upload(&file, &UploadJob::new("cold", "k"), |bytes, pct| {
                seen.push((bytes, pct));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 <= w[1].1));
        assert_eq!(seen.last().copied(), Some((160, 100.0)));
    }

    #[test]
    fn upload_empty_file_sends_one_part() {
        let (_dir, file) = source_with(&[]);
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = ArchivalUploader::new(store.clone(), small_parts());

        let job = UploadJob::new("cold", "empty");
        let report = uploader.upload(&file, &job, |_, _| Ok(())).unwrap();
        assert_eq!(report.parts, 1);
        assert_eq!(report.last_percentage, 100.0);
        assert_eq!(store.object(&job.destination).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn upload_part_failure_aborts() {
        let (_dir, file) = source_with(&[1u8; 160]);
        let store = Arc::new(MemoryObjectStore::new());
        store.fail_parts_after(4);
        let uploader = ArchivalUploader::new(store.clone(), small_parts());

        let job = UploadJob::new("cold", "k");
        match uploader.upload(&file, &job, |_, _| Ok(())).unwrap_err() {
            StorageError::UploadFailed {
                bucket,
                key,
                bytes_transferred,
                parts_completed,
                ..
            } => {
                assert_eq!((bucket.as_str(), key.as_str()), ("cold", "k"));
                assert_eq!(parts_completed, 4);
                assert_eq!(bytes_transferred, 64);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.pending_uploads(), 0);
        assert!(store.object(&job.destination).is_none());
    }

    #[test]
    fn upload_callback_error_cancels() {
        let (_dir, file) = source_with(&[1u8; 160]);
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = ArchivalUploader::new(store.clone(), small_parts());

        let job = UploadJob::new("cold", "k");
        let err = uploader
            .upload(&file, &job, |bytes, _| {
                if bytes >= 32 {
                    Err("operator abort".to_string())
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::UploadFailed { .. }));
        assert!(err.to_string().contains("operator abort"));
        assert!(store.parts_uploaded() < 10);
        assert_eq!(store.pending_uploads(), 0);
    }
}
