//! The storage file contract shared by every backend.

use crate::error::{StorageError, StorageResult};
use std::borrow::Cow;
use std::fmt;
use std::num::NonZeroU64;
use std::time::SystemTime;

/// Default needle padding size in bytes.
pub const NEEDLE_PADDING_SIZE: u64 = 8;

/// Size and modification time of a storage file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Logical size in bytes.
    pub size: u64,
    /// Last time the logical size changed.
    pub modified: SystemTime,
}

/// One open handle onto a volume's physical data.
///
/// A `StorageFile` is the sole writer of its data. Reads take `&self` so
/// that many readers can share a file behind a read lock; every mutating
/// call takes `&mut self` and must be serialized by the owner.
///
/// # Invariants
///
/// - `stat().size` is at least `offset + accepted` after any successful
///   `write_at(buf, offset)`
/// - the size observed right after open is padded up to the alignment unit
/// - a file that has received data is only empty again after
///   `truncate(0)`
/// - after `close()`, every call except `close()` and `name()` fails with
///   [`StorageError::Closed`]
pub trait StorageFile: Send + Sync + fmt::Debug {
    /// Reads into `buf` starting at `offset` and returns the number of bytes read.
    ///
    /// Returns fewer bytes than requested only when the read reaches the
    /// logical end of the file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::EndOfStream`] if the file is empty or `offset`
    /// is at or past the end, and a seek or read error if the medium fails.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize>;

    /// Writes `buf` at `offset` and returns the number of caller bytes accepted.
    ///
    /// The buffer is zero-padded to the alignment unit before it reaches
    /// the medium. The returned count never includes that padding, but the
    /// tracked size does.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Alignment`] if `offset` is not a multiple of
    /// the alignment unit.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize>;

    /// Appends `buf` at the current size.
    fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        let offset = self.stat()?.size;
        self.write_at(buf, offset)
    }

    /// Extends the file with zeros or shrinks it to `new_size`.
    ///
    /// Shrinking is all-or-nothing: if it fails, the file still holds its
    /// previous content and stays usable.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Makes buffered writes durable on the medium.
    fn sync(&mut self) -> StorageResult<()>;

    /// Releases handles and the medium connection. Closing twice succeeds.
    fn close(&mut self) -> StorageResult<()>;

    /// Returns the logical size and modification time.
    fn stat(&self) -> StorageResult<FileStat>;

    /// Returns the logical path, stable for the life of the handle.
    fn name(&self) -> &str;

    /// Reads exactly `buf.len()` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::EndOfStream`] if the file ends first.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<()> {
        let mut filled = 0usize;
        while filled < buf.len() {
            let at = offset + filled as u64;
            let n = self.read_at(&mut buf[filled..], at)?;
            if n == 0 {
                return Err(StorageError::end_of_stream(self.name(), at));
            }
            filled += n;
        }
        Ok(())
    }
}

/// The needle padding unit that offsets and sizes are rounded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alignment(NonZeroU64);

impl Alignment {
    /// The default unit, [`NEEDLE_PADDING_SIZE`].
    pub const DEFAULT: Self = match NonZeroU64::new(NEEDLE_PADDING_SIZE) {
        Some(unit) => Self(unit),
        None => unreachable!(),
    };

    /// Creates an alignment policy from a byte count.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidConfig`] if `unit` is zero.
    pub fn new(unit: u64) -> StorageResult<Self> {
        NonZeroU64::new(unit)
            .map(Self)
            .ok_or_else(|| StorageError::InvalidConfig("alignment unit must be positive".into()))
    }

    /// Returns the unit in bytes.
    #[must_use]
    pub const fn unit(self) -> u64 {
        self.0.get()
    }

    /// Rounds `n` up to the next multiple of the unit.
    #[must_use]
    pub const fn align_up(self, n: u64) -> u64 {
        let unit = self.0.get();
        match n % unit {
            0 => n,
            rem => n + (unit - rem),
        }
    }

    /// Returns true if `n` is a multiple of the unit.
    #[must_use]
    pub const fn is_aligned(self, n: u64) -> bool {
        n % self.0.get() == 0
    }

    /// Rejects offsets that are not a multiple of the unit.
    pub fn check_offset(self, path: &str, offset: u64) -> StorageResult<()> {
        if self.is_aligned(offset) {
            Ok(())
        } else {
            Err(StorageError::Alignment {
                path: path.to_string(),
                offset,
                unit: self.unit(),
            })
        }
    }

    /// Zero-pads `buf` to a multiple of the unit, borrowing when no padding is needed.
    #[must_use]
    pub fn pad<'a>(self, buf: &'a [u8]) -> Cow<'a, [u8]> {
        let padded_len = self.align_up(buf.len() as u64) as usize;
        if padded_len == buf.len() {
            Cow::Borrowed(buf)
        } else {
            let mut padded = vec![0u8; padded_len];
            padded[..buf.len()].copy_from_slice(buf);
            Cow::Owned(padded)
        }
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Handle lifetime policy for adapters whose medium has a connection cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlePolicy {
    /// Open a fresh handle for every call and close it right after.
    #[default]
    PerOperation,
    /// Open handles once and reuse them until close, reopening lazily
    /// when a handle turns out to be unusable.
    Persistent,
}

/// Number of bytes a read at `offset` may return from a file of `size` bytes.
pub(crate) fn readable_len(size: u64, offset: u64, want: usize) -> usize {
    let remaining = size.saturating_sub(offset);
    usize::try_from(remaining).map_or(want, |r| r.min(want))
}
