//! Error types for volstore core.

use crate::types::{NeedleId, VolumeId};
use crate::vacuum::VacuumPhase;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in volume and vacuum operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] volstore_storage::StorageError),

    /// No such volume.
    #[error("volume {volume} not found")]
    VolumeNotFound {
        /// The volume requested.
        volume: VolumeId,
    },

    /// A volume with this id already exists.
    #[error("volume {volume} already exists")]
    VolumeExists {
        /// The conflicting volume.
        volume: VolumeId,
    },

    /// The volume is read-only or sealed.
    #[error("volume {volume} is read-only")]
    ReadOnly {
        /// The volume written to.
        volume: VolumeId,
    },

    /// A vacuum holds the volume.
    #[error("vacuum in progress on volume {volume}")]
    VacuumInProgress {
        /// The volume being vacuumed.
        volume: VolumeId,
    },

    /// A vacuum phase was invoked out of order.
    #[error("cannot {operation} volume {volume} in phase {phase}")]
    InvalidPhase {
        /// The volume.
        volume: VolumeId,
        /// Phase the volume is in.
        phase: VacuumPhase,
        /// The rejected operation.
        operation: &'static str,
    },

    /// No such needle.
    #[error("needle {needle} not found in volume {volume}")]
    NeedleNotFound {
        /// The volume searched.
        volume: VolumeId,
        /// The needle requested.
        needle: NeedleId,
    },

    /// The volume is not sealed.
    #[error("volume {volume} is not sealed")]
    NotSealed {
        /// The volume.
        volume: VolumeId,
    },

    /// A data file is structurally invalid.
    #[error("corrupted volume file {path} at offset {offset}: {message}")]
    Corrupted {
        /// Logical path of the file.
        path: String,
        /// Offset of the bad structure.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// Needle data failed its checksum.
    #[error("checksum mismatch on needle {needle}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// The needle read.
        needle: NeedleId,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// A compaction stopped before completing.
    #[error("compaction of volume {volume} aborted: {reason}")]
    CompactionAborted {
        /// The volume.
        volume: VolumeId,
        /// Why it stopped.
        reason: String,
    },

    /// Operation not permitted.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corrupted(path: impl Into<String>, offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            offset,
            message: message.into(),
        }
    }

    /// Creates a compaction aborted error.
    pub fn compaction_aborted(volume: VolumeId, reason: impl Into<String>) -> Self {
        Self::CompactionAborted {
            volume,
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid phase error.
    pub fn invalid_phase(volume: VolumeId, phase: VacuumPhase, operation: &'static str) -> Self {
        Self::InvalidPhase {
            volume,
            phase,
            operation,
        }
    }

    /// Returns true if the storage medium is unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_fatal())
    }
}
