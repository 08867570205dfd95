//! Binary layout of chunk headers, footers and position maps
//!
//! ```text
//! [ header: 128 ][ transform header ][ data ... ][ position map ][ footer: 128 ]
//! ```
//!
//! Header layout (little-endian):
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 1    | file type        |
//! | 1      | 1    | version          |
//! | 2      | 4    | chunk size       |
//! | 6      | 4    | start number     |
//! | 10     | 4    | end number       |
//! | 14     | 1    | is scavenged     |
//! | 15     | 16   | chunk id         |
//! | 31     | 1    | transform tag    |
//!
//! Footer layout (little-endian), hash always in the last 16 bytes:
//!
//! | offset | size  | field                                   |
//! |--------|-------|-----------------------------------------|
//! | 0      | 1     | flags (completed, 12-byte map entries)  |
//! | 1      | 4     | physical data size                      |
//! | 5      | 8 / 4 | logical data size (8 with 12-byte maps) |
//! | 13 / 9 | 4     | map size                                |
//! | 112    | 16    | content hash                            |

use uuid::Uuid;

use crate::chunk::transform::TransformKind;
use crate::error::StorageError;

pub const HEADER_SIZE: usize = 128;
pub const FOOTER_SIZE: usize = 128;
pub const CHECKSUM_SIZE: usize = 16;

/// Frame overhead: length prefix and suffix
pub const FRAME_OVERHEAD: usize = 8;

pub const CHUNK_FILE_TYPE: u8 = 1;
pub const CURRENT_CHUNK_VERSION: u8 = 4;
/// Oldest version this build can open
pub const MIN_CHUNK_VERSION: u8 = 3;

const FOOTER_COMPLETED: u8 = 0x01;
const FOOTER_MAP_12_BYTES: u8 = 0x02;

/// Written once at chunk creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u8,
    pub chunk_size: i32,
    pub chunk_start_number: i32,
    pub chunk_end_number: i32,
    pub is_scavenged: bool,
    pub chunk_id: Uuid,
    pub transform: TransformKind,
}

impl ChunkHeader {
    pub fn new(
        chunk_size: i32,
        chunk_start_number: i32,
        chunk_end_number: i32,
        is_scavenged: bool,
        transform: TransformKind,
    ) -> Self {
        Self {
            version: CURRENT_CHUNK_VERSION,
            chunk_size,
            chunk_start_number,
            chunk_end_number,
            is_scavenged,
            chunk_id: Uuid::new_v4(),
            transform,
        }
    }

    /// Global position of the first byte covered by this chunk
    pub fn chunk_start_position(&self) -> i64 {
        self.chunk_start_number as i64 * self.chunk_size as i64
    }

    /// Global position one past the last byte covered by this chunk
    pub fn chunk_end_position(&self) -> i64 {
        (self.chunk_end_number as i64 + 1) * self.chunk_size as i64
    }

    /// Logical bytes this chunk can hold
    pub fn data_capacity(&self) -> i64 {
        self.chunk_end_position() - self.chunk_start_position()
    }

    /// Convert a global log position to a chunk-local one
    pub fn local_position(&self, global: i64) -> i64 {
        global - self.chunk_start_position()
    }

    pub fn contains(&self, global: i64) -> bool {
        global >= self.chunk_start_position() && global < self.chunk_end_position()
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = CHUNK_FILE_TYPE;
        buf[1] = self.version;
        buf[2..6].copy_from_slice(&self.chunk_size.to_le_bytes());
        buf[6..10].copy_from_slice(&self.chunk_start_number.to_le_bytes());
        buf[10..14].copy_from_slice(&self.chunk_end_number.to_le_bytes());
        buf[14] = self.is_scavenged as u8;
        buf[15..31].copy_from_slice(self.chunk_id.as_bytes());
        buf[31] = self.transform as u8;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StorageError> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::corrupt(
                "<header>",
                format!("header needs {HEADER_SIZE} bytes, got {}", buf.len()),
            ));
        }
        if buf[0] != CHUNK_FILE_TYPE {
            return Err(StorageError::corrupt(
                "<header>",
                format!("unexpected file type {}", buf[0]),
            ));
        }
        let version = buf[1];
        if !(MIN_CHUNK_VERSION..=CURRENT_CHUNK_VERSION).contains(&version) {
            return Err(StorageError::corrupt(
                "<header>",
                format!("unsupported chunk version {version}"),
            ));
        }

        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[15..31]);
        // Version 3 predates transforms; its byte 31 is padding.
        let transform = if version >= 4 {
            TransformKind::from_tag(buf[31])?
        } else {
            TransformKind::Identity
        };

        Ok(Self {
            version,
            chunk_size: read_i32(buf, 2),
            chunk_start_number: read_i32(buf, 6),
            chunk_end_number: read_i32(buf, 10),
            is_scavenged: buf[14] != 0,
            chunk_id: Uuid::from_bytes(id),
            transform,
        })
    }
}

/// Written exactly once when the chunk completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFooter {
    pub is_completed: bool,
    pub is_map_12_bytes: bool,
    pub physical_data_size: i32,
    pub logical_data_size: i64,
    pub map_size: i32,
    pub hash: [u8; CHECKSUM_SIZE],
}

impl ChunkFooter {
    pub fn new(physical_data_size: i32, logical_data_size: i64, map_size: i32) -> Self {
        Self {
            is_completed: true,
            is_map_12_bytes: true,
            physical_data_size,
            logical_data_size,
            map_size,
            hash: [0u8; CHECKSUM_SIZE],
        }
    }

    pub fn with_hash(mut self, hash: [u8; CHECKSUM_SIZE]) -> Self {
        self.hash = hash;
        self
    }

    pub fn map_entry_size(&self) -> usize {
        if self.is_map_12_bytes {
            PosMap::FULL_SIZE
        } else {
            PosMap::LEGACY_SIZE
        }
    }

    pub fn map_count(&self) -> usize {
        self.map_size as usize / self.map_entry_size()
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        let mut flags = 0u8;
        if self.is_completed {
            flags |= FOOTER_COMPLETED;
        }
        if self.is_map_12_bytes {
            flags |= FOOTER_MAP_12_BYTES;
        }
        buf[0] = flags;
        buf[1..5].copy_from_slice(&self.physical_data_size.to_le_bytes());
        if self.is_map_12_bytes {
            buf[5..13].copy_from_slice(&self.logical_data_size.to_le_bytes());
            buf[13..17].copy_from_slice(&self.map_size.to_le_bytes());
        } else {
            buf[5..9].copy_from_slice(&(self.logical_data_size as i32).to_le_bytes());
            buf[9..13].copy_from_slice(&self.map_size.to_le_bytes());
        }
        buf[FOOTER_SIZE - CHECKSUM_SIZE..].copy_from_slice(&self.hash);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, StorageError> {
        if buf.len() < FOOTER_SIZE {
            return Err(StorageError::corrupt(
                "<footer>",
                format!("footer needs {FOOTER_SIZE} bytes, got {}", buf.len()),
            ));
        }
        let flags = buf[0];
        let is_map_12_bytes = flags & FOOTER_MAP_12_BYTES != 0;
        let (logical_data_size, map_size) = if is_map_12_bytes {
            (read_i64(buf, 5), read_i32(buf, 13))
        } else {
            (read_i32(buf, 5) as i64, read_i32(buf, 9))
        };
        let physical_data_size = read_i32(buf, 1);
        if physical_data_size < 0 || logical_data_size < 0 || map_size < 0 {
            return Err(StorageError::corrupt(
                "<footer>",
                format!(
                    "negative size: physical {physical_data_size}, logical {logical_data_size}, map {map_size}"
                ),
            ));
        }
        let entry_size = if is_map_12_bytes {
            PosMap::FULL_SIZE
        } else {
            PosMap::LEGACY_SIZE
        };
        if map_size as usize % entry_size != 0 {
            return Err(StorageError::corrupt(
                "<footer>",
                format!("map size {map_size} is not a multiple of {entry_size}"),
            ));
        }
        let mut hash = [0u8; CHECKSUM_SIZE];
        hash.copy_from_slice(&buf[FOOTER_SIZE - CHECKSUM_SIZE..FOOTER_SIZE]);

        Ok(Self {
            is_completed: flags & FOOTER_COMPLETED != 0,
            is_map_12_bytes,
            physical_data_size,
            logical_data_size,
            map_size,
            hash,
        })
    }
}

/// One entry of a scavenged chunk's position map
///
/// `log_pos` is the chunk-local logical position the record had before the
/// rewrite; `actual_pos` is where its frame lives in the new data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PosMap {
    pub log_pos: i64,
    pub actual_pos: i32,
}

impl PosMap {
    /// 8-byte logical position + 4-byte physical position
    pub const FULL_SIZE: usize = 12;
    /// Packed `(log_pos << 32) | actual_pos`
    pub const LEGACY_SIZE: usize = 8;

    pub fn new(log_pos: i64, actual_pos: i32) -> Self {
        Self { log_pos, actual_pos }
    }

    pub fn write_full(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.log_pos.to_le_bytes());
        out.extend_from_slice(&self.actual_pos.to_le_bytes());
    }

    pub fn read(buf: &[u8], entry_size: usize) -> Self {
        if entry_size == Self::FULL_SIZE {
            Self {
                log_pos: read_i64(buf, 0),
                actual_pos: read_i32(buf, 8),
            }
        } else {
            let packed = u64::from_le_bytes(buf[0..8].try_into().unwrap_or([0u8; 8]));
            Self {
                log_pos: (packed >> 32) as i64,
                actual_pos: (packed & 0xFFFF_FFFF) as u32 as i32,
            }
        }
    }

    /// Decode a whole map region
    pub fn read_all(buf: &[u8], entry_size: usize) -> Vec<Self> {
        buf.chunks_exact(entry_size)
            .map(|entry| Self::read(entry, entry_size))
            .collect()
    }

    /// Resolve a chunk-local logical position against a sorted map
    pub fn lookup(map: &[PosMap], log_pos: i64) -> Option<i32> {
        map.binary_search_by_key(&log_pos, |entry| entry.log_pos)
            .ok()
            .map(|index| map[index].actual_pos)
    }
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    i64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = ChunkHeader::new(4096, 3, 5, true, TransformKind::Checksum);
        let bytes = header.to_bytes();

        assert_eq!(bytes[0], CHUNK_FILE_TYPE);
        assert_eq!(bytes[1], CURRENT_CHUNK_VERSION);
        assert_eq!(&bytes[2..6], &4096i32.to_le_bytes());
        assert_eq!(&bytes[6..10], &3i32.to_le_bytes());
        assert_eq!(&bytes[10..14], &5i32.to_le_bytes());
        assert_eq!(bytes[14], 1);
        assert_eq!(&bytes[15..31], header.chunk_id.as_bytes());
        assert_eq!(bytes[31], TransformKind::Checksum as u8);
        assert!(bytes[32..].iter().all(|b| *b == 0));

        assert_eq!(ChunkHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_positions() {
        let header = ChunkHeader::new(1000, 2, 4, true, TransformKind::Identity);
        assert_eq!(header.chunk_start_position(), 2000);
        assert_eq!(header.chunk_end_position(), 5000);
        assert_eq!(header.data_capacity(), 3000);
        assert_eq!(header.local_position(2500), 500);
        assert!(header.contains(4999));
        assert!(!header.contains(5000));
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let mut bytes = ChunkHeader::new(4096, 0, 0, false, TransformKind::Identity).to_bytes();
        bytes[1] = 9;
        assert!(matches!(
            ChunkHeader::from_bytes(&bytes),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_footer_hash_is_last() {
        let footer = ChunkFooter::new(900, 1000, 24).with_hash([7u8; CHECKSUM_SIZE]);
        let bytes = footer.to_bytes();
        assert_eq!(bytes[0], FOOTER_COMPLETED | FOOTER_MAP_12_BYTES);
        assert_eq!(&bytes[FOOTER_SIZE - CHECKSUM_SIZE..], &[7u8; CHECKSUM_SIZE]);
        assert_eq!(ChunkFooter::from_bytes(&bytes).unwrap(), footer);
        assert_eq!(footer.map_count(), 2);
    }

    #[test]
    fn test_footer_rejects_bad_sizes() {
        let mut bytes = ChunkFooter::new(900, 1000, 24).to_bytes();
        bytes[13..17].copy_from_slice(&(-12i32).to_le_bytes());
        assert!(matches!(
            ChunkFooter::from_bytes(&bytes),
            Err(StorageError::Corrupt { .. })
        ));

        let bytes = ChunkFooter::new(-1, 1000, 0).to_bytes();
        tokio_test::assert_err!(ChunkFooter::from_bytes(&bytes));

        // Not a whole number of 12-byte entries
        let bytes = ChunkFooter::new(900, 1000, 20).to_bytes();
        tokio_test::assert_err!(ChunkFooter::from_bytes(&bytes));
    }

    #[test]
    fn test_legacy_footer_layout() {
        let mut footer = ChunkFooter::new(100, 120, 16);
        footer.is_map_12_bytes = false;
        let bytes = footer.to_bytes();
        assert_eq!(&bytes[5..9], &120i32.to_le_bytes());
        assert_eq!(&bytes[9..13], &16i32.to_le_bytes());
        let parsed = ChunkFooter::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.logical_data_size, 120);
        assert_eq!(parsed.map_count(), 2);
    }

    #[test]
    fn test_pos_map_lookup() {
        let map = vec![PosMap::new(0, 0), PosMap::new(120, 40), PosMap::new(400, 90)];
        assert_eq!(PosMap::lookup(&map, 120), Some(40));
        assert_eq!(PosMap::lookup(&map, 400), Some(90));
        assert_eq!(PosMap::lookup(&map, 121), None);
    }

    #[test]
    fn test_pos_map_widths() {
        let mut full = Vec::new();
        PosMap::new(5_000_000_000, 77).write_full(&mut full);
        assert_eq!(full.len(), PosMap::FULL_SIZE);
        assert_eq!(PosMap::read(&full, PosMap::FULL_SIZE), PosMap::new(5_000_000_000, 77));

        let packed: u64 = (300u64 << 32) | 12;
        let legacy = PosMap::read(&packed.to_le_bytes(), PosMap::LEGACY_SIZE);
        assert_eq!(legacy, PosMap::new(300, 12));
    }
}
