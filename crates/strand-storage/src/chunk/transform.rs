//! Per-chunk data transforms
//!
//! A transform is chosen when a chunk is created and recorded in its
//! header, followed by a transform-specific header at offset
//! [`HEADER_SIZE`](super::format::HEADER_SIZE). It applies to each frame
//! body independently so a record at any position can be decoded without
//! touching its neighbours.
//!
//! - `Identity`: bytes are stored as-is
//! - `Checksum`: a CRC32 trails every body
//! - `Compressed`: every body is deflated
//! - `Encrypted`: every body is XORed with a keystream seeked to its offset

use std::fmt;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::chunk::format::HEADER_SIZE;
use crate::error::StorageError;

const NONCE_SIZE: usize = 16;
const KEY_CHECK_SIZE: usize = 8;
const CRC_SIZE: usize = 4;

/// Largest body a compressed frame may inflate to
pub const MAX_INFLATED_SIZE: usize = 16 * 1024 * 1024;

/// Transform tag stored at byte 31 of the chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransformKind {
    #[default]
    Identity = 0,
    Checksum = 1,
    Compressed = 2,
    Encrypted = 3,
}

impl TransformKind {
    pub fn from_tag(tag: u8) -> Result<Self, StorageError> {
        match tag {
            0 => Ok(Self::Identity),
            1 => Ok(Self::Checksum),
            2 => Ok(Self::Compressed),
            3 => Ok(Self::Encrypted),
            other => Err(StorageError::transform(format!(
                "unknown transform tag {other}"
            ))),
        }
    }

    /// Size of the transform header that follows the chunk header
    pub fn header_len(self) -> usize {
        match self {
            Self::Identity | Self::Checksum => 0,
            Self::Compressed => 4,
            Self::Encrypted => NONCE_SIZE + KEY_CHECK_SIZE,
        }
    }
}

/// Secret key for the encrypted transform, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a key from a passphrase
    pub fn derive(passphrase: &str) -> Self {
        Self(blake3::derive_key("strand chunk encryption v1", passphrase.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short fingerprint stored in chunk headers to detect a wrong key
    fn check_bytes(&self) -> [u8; KEY_CHECK_SIZE] {
        let digest = blake3::keyed_hash(&self.0, b"strand key check");
        let mut out = [0u8; KEY_CHECK_SIZE];
        out.copy_from_slice(&digest.as_bytes()[..KEY_CHECK_SIZE]);
        out
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("check", &hex::encode(self.check_bytes()))
            .finish_non_exhaustive()
    }
}

/// Which transform new chunks get
///
/// Existing chunks keep the transform they were created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    pub kind: TransformKind,
    /// Deflate level 0-9
    pub compression_level: u32,
    /// Required to create or open encrypted chunks
    #[serde(skip)]
    pub encryption_key: Option<EncryptionKey>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            kind: TransformKind::Identity,
            compression_level: 6,
            encryption_key: None,
        }
    }
}

impl TransformConfig {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn checksum() -> Self {
        Self {
            kind: TransformKind::Checksum,
            ..Self::default()
        }
    }

    pub fn compressed(level: u32) -> Self {
        Self {
            kind: TransformKind::Compressed,
            compression_level: level.min(9),
            ..Self::default()
        }
    }

    pub fn encrypted(key: EncryptionKey) -> Self {
        Self {
            kind: TransformKind::Encrypted,
            encryption_key: Some(key),
            ..Self::default()
        }
    }

    /// Keep the key while switching the transform for new chunks
    pub fn with_kind(mut self, kind: TransformKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }
}

/// Transform bound to a single chunk
#[derive(Clone)]
pub enum ChunkTransform {
    Identity,
    Checksum,
    Compressed { level: u32 },
    Encrypted {
        key: EncryptionKey,
        nonce: [u8; NONCE_SIZE],
    },
}

impl fmt::Debug for ChunkTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identity => write!(f, "Identity"),
            Self::Checksum => write!(f, "Checksum"),
            Self::Compressed { level } => write!(f, "Compressed({level})"),
            Self::Encrypted { nonce, .. } => write!(f, "Encrypted({})", hex::encode(nonce)),
        }
    }
}

impl ChunkTransform {
    /// Instantiate the configured transform for a freshly created chunk
    pub fn for_new_chunk(config: &TransformConfig) -> Result<Self, StorageError> {
        Ok(match config.kind {
            TransformKind::Identity => Self::Identity,
            TransformKind::Checksum => Self::Checksum,
            TransformKind::Compressed => Self::Compressed {
                level: config.compression_level.min(9),
            },
            TransformKind::Encrypted => {
                let key = config.encryption_key.clone().ok_or_else(|| {
                    StorageError::transform("encrypted transform requires a key")
                })?;
                Self::Encrypted {
                    key,
                    nonce: rand::random(),
                }
            }
        })
    }

    /// Rebuild a chunk's transform from its header tag and transform header
    pub fn from_header(
        kind: TransformKind,
        header: &[u8],
        config: &TransformConfig,
    ) -> Result<Self, StorageError> {
        if header.len() != kind.header_len() {
            return Err(StorageError::transform(format!(
                "{kind:?} header must be {} bytes, got {}",
                kind.header_len(),
                header.len()
            )));
        }
        Ok(match kind {
            TransformKind::Identity => Self::Identity,
            TransformKind::Checksum => Self::Checksum,
            TransformKind::Compressed => {
                let mut level = [0u8; 4];
                level.copy_from_slice(header);
                Self::Compressed {
                    level: u32::from_le_bytes(level),
                }
            }
            TransformKind::Encrypted => {
                let key = config.encryption_key.clone().ok_or_else(|| {
                    StorageError::transform("encrypted chunk found but no key configured")
                })?;
                if header[NONCE_SIZE..] != key.check_bytes() {
                    return Err(StorageError::transform(
                        "configured key does not match the chunk's key",
                    ));
                }
                let mut nonce = [0u8; NONCE_SIZE];
                nonce.copy_from_slice(&header[..NONCE_SIZE]);
                Self::Encrypted { key, nonce }
            }
        })
    }

    pub fn kind(&self) -> TransformKind {
        match self {
            Self::Identity => TransformKind::Identity,
            Self::Checksum => TransformKind::Checksum,
            Self::Compressed { .. } => TransformKind::Compressed,
            Self::Encrypted { .. } => TransformKind::Encrypted,
        }
    }

    /// Bytes written right after the chunk header
    pub fn header_bytes(&self) -> Vec<u8> {
        match self {
            Self::Identity | Self::Checksum => Vec::new(),
            Self::Compressed { level } => level.to_le_bytes().to_vec(),
            Self::Encrypted { key, nonce } => {
                let mut out = nonce.to_vec();
                out.extend_from_slice(&key.check_bytes());
                out
            }
        }
    }

    /// File offset of data position 0
    pub fn data_offset(&self) -> u64 {
        (HEADER_SIZE + self.kind().header_len()) as u64
    }

    /// Map a data-region position to its file offset
    pub fn transform_data_position(&self, data_position: i64) -> u64 {
        self.data_offset() + data_position as u64
    }

    /// Transform a frame body that will be stored at `data_position`
    pub fn encode(&self, data_position: i64, body: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self {
            Self::Identity => Ok(body.to_vec()),
            Self::Checksum => {
                let mut out = Vec::with_capacity(body.len() + CRC_SIZE);
                out.extend_from_slice(body);
                out.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
                Ok(out)
            }
            Self::Compressed { level } => {
                if body.len() > MAX_INFLATED_SIZE {
                    return Err(StorageError::transform(format!(
                        "body of {} bytes exceeds the {MAX_INFLATED_SIZE} byte limit",
                        body.len()
                    )));
                }
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(*level));
                encoder
                    .write_all(body)
                    .map_err(|e| StorageError::transform(format!("deflate: {e}")))?;
                encoder
                    .finish()
                    .map_err(|e| StorageError::transform(format!("deflate: {e}")))
            }
            Self::Encrypted { key, nonce } => {
                let mut out = body.to_vec();
                apply_keystream(key, nonce, data_position, &mut out);
                Ok(out)
            }
        }
    }

    /// Reverse [`ChunkTransform::encode`] for the body stored at `data_position`
    pub fn decode(&self, data_position: i64, stored: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self {
            Self::Identity => Ok(stored.to_vec()),
            Self::Checksum => {
                if stored.len() < CRC_SIZE {
                    return Err(StorageError::transform("body shorter than its checksum"));
                }
                let (body, crc) = stored.split_at(stored.len() - CRC_SIZE);
                let mut expected = [0u8; CRC_SIZE];
                expected.copy_from_slice(crc);
                let actual = crc32fast::hash(body);
                if actual != u32::from_le_bytes(expected) {
                    return Err(StorageError::transform(format!(
                        "checksum mismatch at data position {data_position}"
                    )));
                }
                Ok(body.to_vec())
            }
            Self::Compressed { .. } => {
                let mut out = Vec::with_capacity(stored.len() * 2);
                DeflateDecoder::new(stored)
                    .take(MAX_INFLATED_SIZE as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| StorageError::transform(format!("inflate: {e}")))?;
                if out.len() > MAX_INFLATED_SIZE {
                    return Err(StorageError::transform(format!(
                        "frame at data position {data_position} inflates past {MAX_INFLATED_SIZE} bytes"
                    )));
                }
                Ok(out)
            }
            Self::Encrypted { key, nonce } => {
                let mut out = stored.to_vec();
                apply_keystream(key, nonce, data_position, &mut out);
                Ok(out)
            }
        }
    }
}

fn apply_keystream(key: &EncryptionKey, nonce: &[u8; NONCE_SIZE], position: i64, buf: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(key.as_bytes());
    hasher.update(nonce);
    let mut reader = hasher.finalize_xof();
    reader.set_position(position as u64);

    let mut stream = vec![0u8; buf.len()];
    reader.fill(&mut stream);
    for (byte, mask) in buf.iter_mut().zip(stream.iter()) {
        *byte ^= mask;
    }
    stream.zeroize();
}
