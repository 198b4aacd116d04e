//! CLI command implementations.

pub mod inspect;
pub mod needle;
pub mod upload;
pub mod vacuum;
pub mod volume;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use volstore_core::{Store, StoreConfig, Volume, VolumeId};
use volstore_storage::{Alignment, Backend, DiskBackend, StorageConfig};

/// A store opened on the directory given with `--path`.
pub struct Context {
    path: PathBuf,
    store: Arc<Store>,
}

impl Context {
    /// Opens the store under `path`, creating the directory if needed.
    pub fn new(path: PathBuf, alignment: u64) -> Result<Self, Box<dyn std::error::Error>> {
        let alignment = Alignment::new(alignment)?;
        let config = StoreConfig::new()
            .storage(StorageConfig::new().alignment(alignment))
            .create_if_missing(false);

        std::fs::create_dir_all(&path)?;
        let backend: Arc<dyn Backend> = Arc::new(DiskBackend::open(&path, &config.storage)?);
        let store = Arc::new(Store::open(backend, config)?);
        Ok(Self { path, store })
    }

    /// Returns the volume directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the opened store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Looks up a volume by its numeric id.
    pub fn volume(&self, id: u32) -> Result<Arc<Volume>, Box<dyn std::error::Error>> {
        Ok(self.store.volume(VolumeId::new(id))?)
    }
}

/// Parses a needle id given in decimal or as `0x`-prefixed hex.
pub fn parse_needle_id(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(0) => Err("needle id 0 is reserved".to_string()),
        Ok(id) => Ok(id),
        Err(e) => Err(format!("invalid needle id {s:?}: {e}")),
    }
}
