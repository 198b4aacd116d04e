//! Volume superblock.
//!
//! The first bytes of every data file identify it and record which
//! generation it belongs to:
//!
//! ```text
//! +-----------+-------------+--------------+----------------+
//! | "NVOL"(4) | version (2) | reserved (2) | generation (8) |
//! +-----------+-------------+--------------+----------------+
//! ```

use crate::error::{CoreError, CoreResult};
use crate::types::Generation;
use volstore_storage::Alignment;

/// Magic bytes at the start of a data file.
pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"NVOL";

/// Encoded size of the superblock.
pub const SUPERBLOCK_SIZE: u64 = 16;

/// Current data file format version.
pub const FORMAT_VERSION: u16 = 1;

/// Header of a volume data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Format version.
    pub version: u16,
    /// Generation of the file.
    pub generation: Generation,
}

impl Superblock {
    /// Creates a superblock for `generation` at the current version.
    #[must_use]
    pub const fn new(generation: Generation) -> Self {
        Self {
            version: FORMAT_VERSION,
            generation,
        }
    }

    /// Returns the offset of the first needle.
    #[must_use]
    pub const fn data_start(alignment: Alignment) -> u64 {
        alignment.align_up(SUPERBLOCK_SIZE)
    }

    /// Encodes the superblock.
    #[must_use]
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE as usize] {
        let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
        buf[0..4].copy_from_slice(&SUPERBLOCK_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.generation.as_u64().to_le_bytes());
        buf
    }

    /// Decodes and validates a superblock read from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupted`] on a bad magic or unknown version.
    pub fn decode(path: &str, buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < SUPERBLOCK_SIZE as usize {
            return Err(CoreError::corrupted(path, 0, "superblock truncated"));
        }
        if buf[0..4] != SUPERBLOCK_MAGIC {
            return Err(CoreError::corrupted(path, 0, "bad superblock magic"));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != FORMAT_VERSION {
            return Err(CoreError::corrupted(
                path,
                4,
                format!("unsupported format version {version}"),
            ));
        }

        let generation = u64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        Ok(Self {
            version,
            generation: Generation::new(generation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_decode_checks_magic() {
        let mut buf = Superblock::new(Generation::new(4)).encode();
        assert_eq!(
            Superblock::decode("v", &buf).unwrap().generation,
            Generation::new(4)
        );

        buf[0] = b'X';
        assert!(matches!(
            Superblock::decode("v", &buf),
            Err(CoreError::Corrupted { offset: 0, .. })
        ));
    }

    #[test]
    fn superblock_rejects_unknown_version() {
        let mut buf = Superblock::new(Generation::INITIAL).encode();
        buf[4] = 9;
        assert!(Superblock::decode("v", &buf).is_err());
        assert!(Superblock::decode("v", &buf[..8]).is_err());
    }

    #[test]
    fn superblock_data_start_is_aligned() {
        assert_eq!(Superblock::data_start(Alignment::DEFAULT), 16);
        assert_eq!(Superblock::data_start(Alignment::new(64).unwrap()), 64);
    }
}
