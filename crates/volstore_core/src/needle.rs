//! Needle record format.
//!
//! ```text
//! +---------+-------+----------+----------+------+--------+---------+
//! | id (8)  | flags | reserved | data_len | data | crc32c | padding |
//! |         |  (1)  |   (3)    |   (4)    |      |  (4)   |         |
//! +---------+-------+----------+----------+------+--------+---------+
//! ```
//!
//! All integers are little-endian. The checksum covers the data only.
//! Records are zero-padded to the alignment unit so every needle starts
//! at an aligned offset. Deleting a needle appends a tombstone record
//! with no data.

use crate::error::{CoreError, CoreResult};
use crate::types::NeedleId;
use volstore_storage::Alignment;

/// Size of the needle header in bytes.
pub const NEEDLE_HEADER_SIZE: u64 = 16;

/// Size of the data checksum in bytes.
pub const NEEDLE_CHECKSUM_SIZE: u64 = 4;

/// Computes the checksum stored after needle data.
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Flags of a needle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeedleFlags(u8);

impl NeedleFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Record deletes the needle.
    pub const TOMBSTONE: Self = Self(0x01);

    /// Creates flags from the raw byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Self {
        Self(b)
    }

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks if the tombstone flag is set.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        self.0 & 0x01 != 0
    }
}

/// The fixed-size header in front of every needle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedleHeader {
    /// Needle id.
    pub id: NeedleId,
    /// Record flags.
    pub flags: NeedleFlags,
    /// Length of the data in bytes.
    pub data_len: u32,
}

impl NeedleHeader {
    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; NEEDLE_HEADER_SIZE as usize] {
        let mut buf = [0u8; NEEDLE_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.id.as_u64().to_le_bytes());
        buf[8] = self.flags.as_byte();
        buf[12..16].copy_from_slice(&self.data_len.to_le_bytes());
        buf
    }

    /// Decodes a header.
    #[must_use]
    pub fn decode(buf: &[u8; NEEDLE_HEADER_SIZE as usize]) -> Self {
        let id = u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        let data_len = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        Self {
            id: NeedleId::new(id),
            flags: NeedleFlags::from_byte(buf[8]),
            data_len,
        }
    }

    /// Returns true for an all-zero header, which marks unwritten space.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.id.is_reserved() && self.data_len == 0 && self.flags == NeedleFlags::NONE
    }

    /// Returns the length of data plus checksum following the header.
    #[must_use]
    pub fn body_len(&self) -> u64 {
        u64::from(self.data_len) + NEEDLE_CHECKSUM_SIZE
    }

    /// Returns the padded length of the whole record.
    #[must_use]
    pub fn record_len(&self, alignment: Alignment) -> u64 {
        alignment.align_up(NEEDLE_HEADER_SIZE + self.body_len())
    }
}

/// One stored record: an object's bytes or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Needle {
    /// Needle id.
    pub id: NeedleId,
    /// Record flags.
    pub flags: NeedleFlags,
    /// Payload; empty for tombstones.
    pub data: Vec<u8>,
}

impl Needle {
    /// Creates a needle carrying `data`.
    #[must_use]
    pub fn put(id: NeedleId, data: Vec<u8>) -> Self {
        Self {
            id,
            flags: NeedleFlags::NONE,
            data,
        }
    }

    /// Creates a tombstone for `id`.
    #[must_use]
    pub fn tombstone(id: NeedleId) -> Self {
        Self {
            id,
            flags: NeedleFlags::TOMBSTONE,
            data: Vec::new(),
        }
    }

    /// Returns whether this is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flags.is_tombstone()
    }

    /// Returns the record header.
    ///
    /// # Errors
    ///
    /// Fails if the data does not fit the 32-bit length field.
    pub fn header(&self) -> CoreResult<NeedleHeader> {
        let data_len = u32::try_from(self.data.len()).map_err(|_| {
            CoreError::invalid_operation(format!(
                "needle {} data of {} bytes exceeds the record limit",
                self.id,
                self.data.len()
            ))
        })?;
        Ok(NeedleHeader {
            id: self.id,
            flags: self.flags,
            data_len,
        })
    }

    /// Appends the padded record to `out` and returns its length.
    ///
    /// # Errors
    ///
    /// Fails if the data does not fit the 32-bit length field.
    pub fn encode_into(&self, alignment: Alignment, out: &mut Vec<u8>) -> CoreResult<u64> {
        let header = self.header()?;
        let record_len = header.record_len(alignment);
        let start = out.len();

        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&checksum(&self.data).to_le_bytes());
        out.resize(start + record_len as usize, 0);

        Ok(record_len)
    }

    /// Decodes a needle from its header and the bytes that follow it.
    ///
    /// `body` must hold at least the data and the checksum; trailing
    /// padding is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChecksumMismatch`] if the data is damaged.
    pub fn decode(header: NeedleHeader, body: &[u8]) -> CoreResult<Self> {
        let data_len = header.data_len as usize;
        if (body.len() as u64) < header.body_len() {
            return Err(CoreError::invalid_operation(format!(
                "needle {} body truncated: {} of {} bytes",
                header.id,
                body.len(),
                header.body_len()
            )));
        }

        let data = &body[..data_len];
        let expected = u32::from_le_bytes([
            body[data_len],
            body[data_len + 1],
            body[data_len + 2],
            body[data_len + 3],
        ]);
        let actual = checksum(data);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch {
                needle: header.id,
                expected,
                actual,
            });
        }

        Ok(Self {
            id: header.id,
            flags: header.flags,
            data: data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn split(record: &[u8]) -> (NeedleHeader, &[u8]) {
        let header: [u8; 16] = record[..16].try_into().unwrap();
        (NeedleHeader::decode(&header), &record[16..])
    }

    #[test]
    fn needle_record_is_padded() {
        let needle = Needle::put(NeedleId::new(1), b"hello".to_vec());
        let mut out = Vec::new();
        let len = needle.encode_into(Alignment::DEFAULT, &mut out).unwrap();

        // 16 + 5 + 4 = 25, padded to 32
        assert_eq!(len, 32);
        assert_eq!(out.len(), 32);
        assert!(out[25..].iter().all(|&b| b == 0));
    }

    #[test]
    fn needle_decode_restores_data() {
        let needle = Needle::put(NeedleId::new(42), b"payload".to_vec());
        let mut out = Vec::new();
        needle.encode_into(Alignment::DEFAULT, &mut out).unwrap();

        let (header, body) = split(&out);
        assert_eq!(header.id, NeedleId::new(42));
        assert_eq!(header.data_len, 7);
        assert_eq!(Needle::decode(header, body).unwrap(), needle);
    }

    #[test]
    fn needle_corrupt_data_fails_checksum() {
        let needle = Needle::put(NeedleId::new(9), vec![1, 2, 3, 4]);
        let mut out = Vec::new();
        needle.encode_into(Alignment::DEFAULT, &mut out).unwrap();
        out[17] ^= 0xff;

        let (header, body) = split(&out);
        assert!(matches!(
            Needle::decode(header, body),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn needle_tombstone_has_no_data() {
        let tombstone = Needle::tombstone(NeedleId::new(5));
        assert!(tombstone.is_tombstone());

        let mut out = Vec::new();
        let len = tombstone.encode_into(Alignment::DEFAULT, &mut out).unwrap();
        assert_eq!(len, 24);

        let (header, body) = split(&out);
        assert!(header.flags.is_tombstone());
        assert!(Needle::decode(header, body).unwrap().data.is_empty());
    }

    #[test]
    fn needle_blank_header_marks_unwritten_space() {
        let header = NeedleHeader::decode(&[0u8; 16]);
        assert!(header.is_blank());
        assert!(!Needle::tombstone(NeedleId::new(1)).header().unwrap().is_blank());
    }

    #[test]
    fn needle_wider_alignment() {
        let alignment = Alignment::new(64).unwrap();
        let header = Needle::put(NeedleId::new(1), vec![0; 10]).header().unwrap();
        assert_eq!(header.record_len(alignment), 64);
    }

    proptest! {
        #[test]
        fn needle_record_len_matches_encoding(
            data in prop::collection::vec(any::<u8>(), 0..200),
            unit in prop::sample::select(vec![8u64, 16, 32, 512]),
        ) {
            let alignment = Alignment::new(unit).unwrap();
            let needle = Needle::put(NeedleId::new(1), data);
            let mut out = Vec::new();
            let len = needle.encode_into(alignment, &mut out).unwrap();

            prop_assert_eq!(len, out.len() as u64);
            prop_assert_eq!(len % unit, 0);
            prop_assert_eq!(len, needle.header().unwrap().record_len(alignment));
        }
    }
}
