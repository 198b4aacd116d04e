//! The volume store: every volume held by one backend.

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::layout;
use crate::types::VolumeId;
use crate::volume::Volume;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};
use volstore_storage::{ArchivalUploader, Backend, UploadJob, UploadReport};

/// A set of volumes on one backend.
#[derive(Debug)]
pub struct Store {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    volumes: RwLock<BTreeMap<VolumeId, Arc<Volume>>>,
}

impl Store {
    /// Opens every volume found on `backend`.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while recovering a volume.
    pub fn open(backend: Arc<dyn Backend>, config: StoreConfig) -> CoreResult<Self> {
        let ids: BTreeSet<VolumeId> = backend
            .list("")?
            .iter()
            .filter_map(|name| layout::parse(name).map(|(vid, _)| vid))
            .collect();

        let mut volumes = BTreeMap::new();
        for id in ids {
            match Volume::open(id, Arc::clone(&backend), config.clone()) {
                Ok(volume) => {
                    volumes.insert(id, Arc::new(volume));
                }
                // Only markers left behind; nothing to serve.
                Err(CoreError::VolumeNotFound { .. }) => {
                    warn!(volume = %id, "ignoring volume without data files");
                }
                Err(e) => return Err(e),
            }
        }

        info!(backend = %backend.kind(), volumes = volumes.len(), "opened store");
        Ok(Self {
            backend,
            config,
            volumes: RwLock::new(volumes),
        })
    }

    /// Returns the backend the store lives on.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Creates a new volume.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VolumeExists`] if the id is taken.
    pub fn create_volume(&self, id: VolumeId) -> CoreResult<Arc<Volume>> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&id) {
            return Err(CoreError::VolumeExists { volume: id });
        }
        let volume = Arc::new(Volume::create(
            id,
            Arc::clone(&self.backend),
            self.config.clone(),
        )?);
        volumes.insert(id, Arc::clone(&volume));
        Ok(volume)
    }

    /// Returns a loaded volume, opening it from the backend if needed.
    ///
    /// Creates the volume if it does not exist and
    /// [`StoreConfig::create_if_missing`] is set.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VolumeNotFound`] if the volume does not exist
    /// and may not be created.
    pub fn open_volume(&self, id: VolumeId) -> CoreResult<Arc<Volume>> {
        let mut volumes = self.volumes.write();
        if let Some(volume) = volumes.get(&id) {
            return Ok(Arc::clone(volume));
        }

        let volume = match Volume::open(id, Arc::clone(&self.backend), self.config.clone()) {
            Ok(volume) => volume,
            Err(CoreError::VolumeNotFound { .. }) if self.config.create_if_missing => {
                Volume::create(id, Arc::clone(&self.backend), self.config.clone())?
            }
            Err(e) => return Err(e),
        };
        let volume = Arc::new(volume);
        volumes.insert(id, Arc::clone(&volume));
        Ok(volume)
    }

    /// Returns a loaded volume.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VolumeNotFound`] if the volume is not loaded.
    pub fn volume(&self, id: VolumeId) -> CoreResult<Arc<Volume>> {
        self.volumes
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::VolumeNotFound { volume: id })
    }

    /// Returns the ids of loaded volumes in ascending order.
    #[must_use]
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.volumes.read().keys().copied().collect()
    }

    /// Unloads and closes a volume.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::VolumeNotFound`] if the volume is not loaded.
    pub fn close_volume(&self, id: VolumeId) -> CoreResult<()> {
        let volume = self
            .volumes
            .write()
            .remove(&id)
            .ok_or(CoreError::VolumeNotFound { volume: id })?;
        volume.close()
    }

    /// Uploads a sealed volume's data file to object storage.
    ///
    /// `progress` receives the bytes sent and the percentage done; an
    /// `Err` from it cancels the upload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotSealed`] unless the volume is sealed, and
    /// the upload error if the transfer fails.
    pub fn archive_volume<F>(
        &self,
        id: VolumeId,
        uploader: &ArchivalUploader,
        job: &UploadJob,
        progress: F,
    ) -> CoreResult<UploadReport>
    where
        F: FnMut(u64, f32) -> Result<(), String> + Send,
    {
        let volume = self.volume(id)?;
        if !volume.is_sealed() {
            return Err(CoreError::NotSealed { volume: id });
        }

        let report = volume.with_data_file(|file| uploader.upload(file, job, progress))?;
        info!(
            volume = %id,
            destination = %report.location,
            size = report.size,
            parts = report.parts,
            "archived volume"
        );
        Ok(report)
    }

    /// Closes every loaded volume.
    ///
    /// # Errors
    ///
    /// Returns the first close error; the remaining volumes are still closed.
    pub fn close(&self) -> CoreResult<()> {
        let volumes = std::mem::take(&mut *self.volumes.write());
        let mut first_error = None;
        for (id, volume) in volumes {
            if let Err(e) = volume.close() {
                warn!(volume = %id, error = %e, "failed to close volume");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NeedleId;
    use tempfile::tempdir;
    use volstore_storage::{DiskBackend, MemoryObjectStore, ObjectStore, UploadConfig};

    fn disk_backend(dir: &std::path::Path) -> Arc<dyn Backend> {
        Arc::new(DiskBackend::open(dir, &StoreConfig::default().storage).unwrap())
    }

    #[test]
    fn store_discovers_volumes_on_open() {
        let dir = tempdir().unwrap();
        let store = Store::open(disk_backend(dir.path()), StoreConfig::default()).unwrap();
        store.create_volume(VolumeId::new(2)).unwrap();
        store
            .create_volume(VolumeId::new(7))
            .unwrap()
            .write_needle(NeedleId::new(1), b"x")
            .unwrap();
        assert!(matches!(
            store.create_volume(VolumeId::new(2)),
            Err(CoreError::VolumeExists { .. })
        ));
        store.close().unwrap();

        let store = Store::open(disk_backend(dir.path()), StoreConfig::default()).unwrap();
        assert_eq!(store.volume_ids(), vec![VolumeId::new(2), VolumeId::new(7)]);
        assert_eq!(
            store.volume(VolumeId::new(7)).unwrap().read_needle(NeedleId::new(1)).unwrap(),
            b"x"
        );
    }

    #[test]
    fn store_open_volume_honors_create_if_missing() {
        let dir = tempdir().unwrap();
        let strict = Store::open(
            disk_backend(dir.path()),
            StoreConfig::default().create_if_missing(false),
        )
        .unwrap();
        assert!(matches!(
            strict.open_volume(VolumeId::new(3)),
            Err(CoreError::VolumeNotFound { .. })
        ));

        let lenient = Store::open(disk_backend(dir.path()), StoreConfig::default()).unwrap();
        let volume = lenient.open_volume(VolumeId::new(3)).unwrap();
        assert!(Arc::ptr_eq(&volume, &lenient.open_volume(VolumeId::new(3)).unwrap()));
    }

    #[test]
    fn store_close_volume_unloads() {
        let dir = tempdir().unwrap();
        let store = Store::open(disk_backend(dir.path()), StoreConfig::default()).unwrap();
        store.create_volume(VolumeId::new(1)).unwrap();
        store.close_volume(VolumeId::new(1)).unwrap();
        assert!(store.volume(VolumeId::new(1)).is_err());
        assert!(store.close_volume(VolumeId::new(1)).is_err());
    }

    #[test]
    fn store_archive_requires_sealed_volume() {
        let dir = tempdir().unwrap();
        let store = Store::open(disk_backend(dir.path()), StoreConfig::default()).unwrap();
        let volume = store.create_volume(VolumeId::new(5)).unwrap();
        for i in 1..=20u64 {
            volume.write_needle(NeedleId::new(i), &[7u8; 300]).unwrap();
        }

        let objects = Arc::new(MemoryObjectStore::new());
        let uploader = ArchivalUploader::new(
            Arc::clone(&objects) as Arc<dyn ObjectStore>,
            UploadConfig::new().min_part_size(1024),
        );
        let job = UploadJob::new("cold", "volumes/5.dat");

        assert!(matches!(
            store.archive_volume(VolumeId::new(5), &uploader, &job, |_, _| Ok(())),
            Err(CoreError::NotSealed { .. })
        ));

        volume.seal().unwrap();
        let report = store
            .archive_volume(VolumeId::new(5), &uploader, &job, |_, _| Ok(()))
            .unwrap();
        assert_eq!(report.size, volume.content_size());
        assert!(report.parts > 1);
    }
}
