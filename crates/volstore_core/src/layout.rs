//! Naming of volume files on a backend.
//!
//! ```text
//! <vid>.g<gen>.dat    data file of one generation
//! <vid>.g<gen>.cmt    commit marker; generation 0 needs none
//! <vid>.g<gen>.cpt    compaction into this generation finished
//! <vid>.sealed        present once the volume is sealed
//! ```

use crate::types::{Generation, VolumeId};

const DATA_EXT: &str = "dat";
const COMMIT_EXT: &str = "cmt";
const COMPACTED_EXT: &str = "cpt";
const SEALED_SUFFIX: &str = "sealed";

/// Kind of a volume file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Generation data file.
    Data(Generation),
    /// Generation commit marker.
    CommitMarker(Generation),
    /// Finished-compaction marker.
    CompactedMarker(Generation),
    /// Seal marker.
    Sealed,
}

/// Returns the data file name of a generation.
#[must_use]
pub fn data_file(volume: VolumeId, generation: Generation) -> String {
    format!("{volume}.g{}.{DATA_EXT}", generation.as_u64())
}

/// Returns the commit marker name of a generation.
#[must_use]
pub fn commit_marker(volume: VolumeId, generation: Generation) -> String {
    format!("{volume}.g{}.{COMMIT_EXT}", generation.as_u64())
}

/// Returns the marker name recording that compaction into `generation`
/// finished and awaits commit.
#[must_use]
pub fn compacted_marker(volume: VolumeId, generation: Generation) -> String {
    format!("{volume}.g{}.{COMPACTED_EXT}", generation.as_u64())
}

/// Returns the seal marker name of a volume.
#[must_use]
pub fn sealed_marker(volume: VolumeId) -> String {
    format!("{volume}.{SEALED_SUFFIX}")
}

/// Returns the prefix shared by every file of a volume.
#[must_use]
pub fn volume_prefix(volume: VolumeId) -> String {
    format!("{volume}.")
}

/// Parses a file name produced by this module.
#[must_use]
pub fn parse(name: &str) -> Option<(VolumeId, FileKind)> {
    let (volume, rest) = name.split_once('.')?;
    let volume = VolumeId::new(volume.parse().ok()?);
    if rest == SEALED_SUFFIX {
        return Some((volume, FileKind::Sealed));
    }

    let (generation, ext) = rest.strip_prefix('g')?.split_once('.')?;
    let generation = Generation::new(generation.parse().ok()?);
    match ext {
        DATA_EXT => Some((volume, FileKind::Data(generation))),
        COMMIT_EXT => Some((volume, FileKind::CommitMarker(generation))),
        COMPACTED_EXT => Some((volume, FileKind::CompactedMarker(generation))),
        _ => None,
    }
}
