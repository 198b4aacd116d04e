//! In-memory needle index.
//!
//! The map is rebuilt by scanning the data file when a volume opens. It
//! also keeps the byte accounting the vacuum check reads: every record
//! that no longer backs a live needle (superseded puts, deleted puts and
//! the tombstones themselves) counts as garbage.

use crate::types::NeedleId;
use std::collections::HashMap;

/// Where a live needle's record sits in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleLocation {
    /// Offset of the record header.
    pub offset: u64,
    /// Length of the data.
    pub data_len: u32,
    /// Padded length of the whole record.
    pub record_len: u64,
}

/// Index of live needles in one generation.
#[derive(Debug, Clone, Default)]
pub struct NeedleMap {
    entries: HashMap<NeedleId, NeedleLocation>,
    live_bytes: u64,
    garbage_bytes: u64,
}

impl NeedleMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a put, superseding any previous record of the needle.
    pub fn put(&mut self, id: NeedleId, location: NeedleLocation) -> Option<NeedleLocation> {
        self.live_bytes += location.record_len;
        let previous = self.entries.insert(id, location);
        if let Some(old) = previous {
            self.live_bytes -= old.record_len;
            self.garbage_bytes += old.record_len;
        }
        previous
    }

    /// Records a tombstone of `tombstone_len` bytes for `id`.
    pub fn delete(&mut self, id: NeedleId, tombstone_len: u64) -> Option<NeedleLocation> {
        self.garbage_bytes += tombstone_len;
        let previous = self.entries.remove(&id);
        if let Some(old) = previous {
            self.live_bytes -= old.record_len;
            self.garbage_bytes += old.record_len;
        }
        previous
    }

    /// Looks up a live needle.
    #[must_use]
    pub fn get(&self, id: NeedleId) -> Option<NeedleLocation> {
        self.entries.get(&id).copied()
    }

    /// Returns the number of live needles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no needle is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of records backing live needles.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Bytes of records compaction can drop.
    #[must_use]
    pub fn garbage_bytes(&self) -> u64 {
        self.garbage_bytes
    }

    /// Returns live needles in ascending offset order.
    #[must_use]
    pub fn live_by_offset(&self) -> Vec<(NeedleId, NeedleLocation)> {
        let mut live: Vec<_> = self.entries.iter().map(|(id, loc)| (*id, *loc)).collect();
        live.sort_by_key(|(_, loc)| loc.offset);
        live
    }
}
