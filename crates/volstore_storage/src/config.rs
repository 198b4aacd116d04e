//! Storage configuration.

use crate::file::{Alignment, HandlePolicy};

/// Configuration shared by the backend adapters.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Needle padding unit supplied by the volume engine.
    pub alignment: Alignment,

    /// Handle lifetime policy for the remote filesystem adapter.
    pub handle_policy: HandlePolicy,

    /// Buffer size used when copying a file prefix during shrink or rewrite.
    pub copy_chunk_size: usize,

    /// How many times to reopen handles after a truncate swap before
    /// leaving them to be reopened lazily.
    pub reopen_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            alignment: Alignment::DEFAULT,
            handle_policy: HandlePolicy::PerOperation,
            copy_chunk_size: 64 * 1024, // 64 KiB
            reopen_attempts: 3,
        }
    }
}

impl StorageConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the alignment unit.
    #[must_use]
    pub const fn alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = alignment;
        self
    }

    /// Sets the handle lifetime policy.
    #[must_use]
    pub const fn handle_policy(mut self, policy: HandlePolicy) -> Self {
        self.handle_policy = policy;
        self
    }

    /// Sets the copy buffer size. Zero is clamped to one byte.
    #[must_use]
    pub fn copy_chunk_size(mut self, size: usize) -> Self {
        self.copy_chunk_size = size.max(1);
        self
    }

    /// Sets the number of post-swap reopen attempts.
    #[must_use]
    pub const fn reopen_attempts(mut self, attempts: u32) -> Self {
        self.reopen_attempts = attempts;
        self
    }
}

/// Configuration for archival uploads.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Smallest part size used for multipart transfers.
    pub min_part_size: u64,
    /// Upper bound on the number of parts of one transfer.
    pub max_parts: u64,
    /// Factor the part size grows by until the part bound holds.
    pub part_growth_factor: u64,
    /// Number of parts in flight at once.
    pub concurrency: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_part_size: 64 * 1024 * 1024, // 64 MiB
            max_parts: 1000,
            part_growth_factor: 4,
            concurrency: 5,
        }
    }
}

impl UploadConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum part size. Zero is clamped to one byte.
    #[must_use]
    pub fn min_part_size(mut self, size: u64) -> Self {
        self.min_part_size = size.max(1);
        self
    }

    /// Sets the part count bound. Zero is clamped to one.
    #[must_use]
    pub fn max_parts(mut self, parts: u64) -> Self {
        self.max_parts = parts.max(1);
        self
    }

    /// Sets the number of concurrent parts. Zero is clamped to one.
    #[must_use]
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }
}
