//! Store configuration.

use volstore_storage::{Alignment, StorageConfig};

/// Configuration for opening a volume store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend adapter configuration, including the needle alignment unit.
    pub storage: StorageConfig,

    /// Bytes copied between two compaction progress samples.
    pub compaction_batch_bytes: u64,

    /// Whether to sync the data file after every needle write.
    pub sync_on_write: bool,

    /// Whether `open_volume` creates a volume that does not exist.
    pub create_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            compaction_batch_bytes: 1024 * 1024, // 1 MiB
            sync_on_write: false,
            create_if_missing: true,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the backend adapter configuration.
    #[must_use]
    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the compaction progress batch size. Zero is clamped to one byte.
    #[must_use]
    pub fn compaction_batch_bytes(mut self, bytes: u64) -> Self {
        self.compaction_batch_bytes = bytes.max(1);
        self
    }

    /// Sets whether to sync after every needle write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets whether to create missing volumes on open.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Returns the needle alignment unit.
    #[must_use]
    pub fn alignment(&self) -> Alignment {
        self.storage.alignment
    }
}
