//! Test fixtures and store helpers.
//!
//! Provides stores on disposable backends and helpers that fill a volume
//! with a known fraction of deleted needles.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use volstore_core::{CoreResult, NeedleId, Store, StoreConfig, Volume};
use volstore_storage::{Backend, DiskBackend, MemoryNamespace, RemoteBackend};

use crate::crash::CrashableBackend;

/// A test store with automatic cleanup.
///
/// The store sits behind a [`CrashableBackend`] so tests can arm crashes
/// on the same store they populated.
pub struct TestStore {
    /// The store instance.
    pub store: Arc<Store>,
    /// The crash-injecting backend the store writes through.
    pub backend: CrashableBackend,
    /// In-process medium for remote stores.
    pub namespace: Option<MemoryNamespace>,
    config: StoreConfig,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a store on a temporary local directory.
    pub fn disk() -> Self {
        Self::disk_with(StoreConfig::default())
    }

    /// Creates a store on a temporary local directory with `config`.
    pub fn disk_with(config: StoreConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let inner = DiskBackend::open(temp_dir.path(), &config.storage)
            .expect("Failed to open disk backend");
        Self::build(Arc::new(inner), config, None, Some(temp_dir))
    }

    /// Creates a store on an in-process remote filesystem.
    pub fn remote() -> Self {
        Self::remote_with(StoreConfig::default())
    }

    /// Creates a store on an in-process remote filesystem with `config`.
    pub fn remote_with(config: StoreConfig) -> Self {
        let namespace = MemoryNamespace::new("mem://testkit");
        let inner = RemoteBackend::connect(namespace.connector(), &config.storage)
            .expect("Failed to connect remote backend");
        Self::build(Arc::new(inner), config, Some(namespace), None)
    }

    fn build(
        inner: Arc<dyn Backend>,
        config: StoreConfig,
        namespace: Option<MemoryNamespace>,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let backend = CrashableBackend::new(inner);
        let store = Store::open(Arc::new(backend.clone()), config.clone())
            .expect("Failed to open store");
        Self {
            store: Arc::new(store),
            backend,
            namespace,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the directory of a disk store.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Returns the path of a file in a disk store.
    pub fn file_path(&self, name: &str) -> Option<PathBuf> {
        self.path().map(|dir| dir.join(name))
    }

    /// Simulates a restart: closes nothing and opens a fresh store over
    /// the same backend, as a process would after a crash.
    pub fn restart(&mut self) -> CoreResult<Arc<Store>> {
        self.backend.reset();
        let store = Arc::new(Store::open(
            Arc::new(self.backend.clone()),
            self.config.clone(),
        )?);
        self.store = Arc::clone(&store);
        Ok(store)
    }
}

impl std::ops::Deref for TestStore {
    type Target = Store;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Deterministic payload for a needle.
pub fn needle_data(id: NeedleId, len: usize) -> Vec<u8> {
    let seed = id.as_u64();
    (0..len as u64)
        .map(|i| (seed.wrapping_mul(31).wrapping_add(i) % 251) as u8)
        .collect()
}

/// What [`populate_with_garbage`] wrote.
#[derive(Debug, Clone, Default)]
pub struct Population {
    /// Needles still live.
    pub live: Vec<NeedleId>,
    /// Needles written and then deleted.
    pub deleted: Vec<NeedleId>,
    /// Payload length of every needle.
    pub data_len: usize,
}

/// Writes `count` needles of `data_len` bytes (ids 1..=count) and deletes
/// an evenly spread `deleted_fraction` of them.
///
/// With payloads much larger than a tombstone the resulting garbage ratio
/// is close to `deleted_fraction`.
pub fn populate_with_garbage(
    volume: &Volume,
    count: u64,
    data_len: usize,
    deleted_fraction: f64,
) -> CoreResult<Population> {
    let mut population = Population {
        data_len,
        ..Population::default()
    };
    for i in 1..=count {
        let id = NeedleId::new(i);
        volume.write_needle(id, &needle_data(id, data_len))?;
    }

    for i in 1..=count {
        let id = NeedleId::new(i);
        let before = ((i - 1) as f64 * deleted_fraction).floor();
        let after = (i as f64 * deleted_fraction).floor();
        if after > before {
            volume.delete_needle(id)?;
            population.deleted.push(id);
        } else {
            population.live.push(id);
        }
    }
    Ok(population)
}

/// Checks that every live needle reads back its payload and every deleted
/// one is gone.
pub fn verify_population(volume: &Volume, population: &Population) -> CoreResult<()> {
    for id in &population.live {
        let data = volume.read_needle(*id)?;
        assert_eq!(data, needle_data(*id, population.data_len), "needle {id} changed");
    }
    for id in &population.deleted {
        assert!(volume.read_needle(*id).is_err(), "needle {id} came back");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use volstore_core::VolumeId;

    #[test]
    fn fixtures_population_has_requested_fraction() {
        let store = TestStore::disk();
        let volume = store.create_volume(VolumeId::new(1)).unwrap();
        let population = populate_with_garbage(&volume, 100, 1000, 0.4).unwrap();

        assert_eq!(population.deleted.len(), 40);
        assert_eq!(population.live.len(), 60);
        assert!((volume.garbage_ratio() - 0.4).abs() < 0.02);
        verify_population(&volume, &population).unwrap();
    }

    #[test]
    fn fixtures_restart_sees_written_volumes() {
        let mut store = TestStore::remote();
        store.create_volume(VolumeId::new(3)).unwrap();
        let store = store.restart().unwrap();
        assert_eq!(store.volume_ids(), vec![VolumeId::new(3)]);
    }

    #[test]
    fn fixtures_needle_data_is_deterministic() {
        let id = NeedleId::new(5);
        assert_eq!(needle_data(id, 64), needle_data(id, 64));
        assert_ne!(needle_data(id, 64), needle_data(NeedleId::new(6), 64));
    }
}
