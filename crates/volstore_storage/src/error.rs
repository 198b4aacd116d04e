//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Every variant that concerns a single file carries its logical path, and
/// positional failures carry the offset, so an error can be diagnosed
/// without re-deriving the call that produced it.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend medium could not be reached. No volume can open without it.
    #[error("failed to connect to {endpoint}: {reason}")]
    ConnectFailed {
        /// The endpoint that was dialed.
        endpoint: String,
        /// What went wrong.
        reason: String,
    },

    /// The medium could not position to the requested offset.
    #[error("seek to offset {offset} failed on {path}: {source}")]
    Seek {
        /// Logical path of the file.
        path: String,
        /// The requested offset.
        offset: u64,
        /// Underlying medium error.
        source: io::Error,
    },

    /// A read failed.
    #[error("read at offset {offset} failed on {path}: {source}")]
    Read {
        /// Logical path of the file.
        path: String,
        /// The requested offset.
        offset: u64,
        /// Underlying medium error.
        source: io::Error,
    },

    /// A write (or a write-like step such as delete or rename) failed.
    #[error("write at offset {offset} failed on {path}: {source}")]
    Write {
        /// Logical path of the file.
        path: String,
        /// The requested offset.
        offset: u64,
        /// Underlying medium error.
        source: io::Error,
    },

    /// A write offset violated the alignment unit.
    #[error("write offset {offset} on {path} is not aligned to {unit} bytes")]
    Alignment {
        /// Logical path of the file.
        path: String,
        /// The rejected offset.
        offset: u64,
        /// The alignment unit in bytes.
        unit: u64,
    },

    /// A read started at or past the logical end of the file.
    #[error("end of stream on {path} at offset {offset}")]
    EndOfStream {
        /// Logical path of the file.
        path: String,
        /// The requested offset.
        offset: u64,
    },

    /// The file has been closed.
    #[error("storage file {path} is closed")]
    Closed {
        /// Logical path of the file.
        path: String,
    },

    /// An archival transfer failed. There is no partial resume.
    #[error(
        "upload to {bucket}/{key} failed after {bytes_transferred} bytes ({parts_completed} parts): {reason}"
    )]
    UploadFailed {
        /// Destination bucket.
        bucket: String,
        /// Destination key.
        key: String,
        /// Bytes confirmed by the store before the failure.
        bytes_transferred: u64,
        /// Parts confirmed by the store before the failure.
        parts_completed: usize,
        /// What went wrong.
        reason: String,
    },

    /// A configuration value was rejected.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    /// An I/O error from a namespace operation with no file offset.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Creates a seek error.
    pub fn seek(path: impl Into<String>, offset: u64, source: io::Error) -> Self {
        Self::Seek {
            path: path.into(),
            offset,
            source,
        }
    }

    /// Creates a read error.
    pub fn read(path: impl Into<String>, offset: u64, source: io::Error) -> Self {
        Self::Read {
            path: path.into(),
            offset,
            source,
        }
    }

    /// Creates a write error.
    pub fn write(path: impl Into<String>, offset: u64, source: io::Error) -> Self {
        Self::Write {
            path: path.into(),
            offset,
            source,
        }
    }

    /// Creates an end-of-stream error.
    pub fn end_of_stream(path: impl Into<String>, offset: u64) -> Self {
        Self::EndOfStream {
            path: path.into(),
            offset,
        }
    }

    /// Creates a closed error.
    pub fn closed(path: impl Into<String>) -> Self {
        Self::Closed { path: path.into() }
    }

    /// Creates a connect error.
    pub fn connect_failed(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectFailed {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the backend is unusable and the caller cannot retry.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. })
    }

    /// Returns true if this is an end-of-stream condition.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_carries_path_and_offset() {
        let err = StorageError::read(
            "1.g0.dat",
            4096,
            io::Error::new(io::ErrorKind::Other, "boom"),
        );
        let text = err.to_string();
        assert!(text.contains("1.g0.dat"));
        assert!(text.contains("4096"));
    }

    #[test]
    fn only_connect_failed_is_fatal() {
        assert!(StorageError::connect_failed("mem://a", "down").is_fatal());
        assert!(!StorageError::closed("x").is_fatal());
        assert!(!StorageError::end_of_stream("x", 0).is_fatal());
    }
}
