//! Error types for strand-storage
//!
//! Corruption, chain gaps and hash mismatches are fatal at startup: the
//! node must not serve reads from a log it cannot trust.

use strand_core::CoreError;
use thiserror::Error;

/// Errors that can occur in storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Requested item was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A chunk file is structurally invalid
    #[error("Corrupt chunk {chunk}: {reason}")]
    Corrupt { chunk: String, reason: String },

    /// A completed chunk's content hash does not match its footer
    #[error("Hash mismatch in chunk {chunk}: expected {expected}, computed {actual}")]
    HashMismatch {
        chunk: String,
        expected: String,
        actual: String,
    },

    /// The chunk chain has a hole
    #[error("Chunk chain gap: chunk #{missing} is missing")]
    ChainGap { missing: i32 },

    /// A checkpoint write would move backwards
    #[error("Checkpoint {name} cannot regress from {current} to {attempted}")]
    CheckpointRegression {
        name: &'static str,
        current: i64,
        attempted: i64,
    },

    /// A record does not fit into an empty chunk
    #[error("Record of {size} bytes exceeds chunk capacity of {capacity} bytes")]
    RecordTooLarge { size: usize, capacity: i64 },

    /// A write was attempted against a completed chunk
    #[error("Chunk {0} is read-only")]
    ReadOnly(String),

    /// A frame transform failed to encode or decode
    #[error("Transform error: {0}")]
    Transform(String),

    /// Another scavenge is already running
    #[error("Scavenge {0} is already in progress")]
    ScavengeInProgress(String),

    /// No scavenge with that id is known
    #[error("Unknown scavenge: {0}")]
    UnknownScavenge(String),

    /// The store has been closed
    #[error("Storage is closed")]
    Closed,

    /// Record encoding failure from strand-core
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Convert from postcard Error to StorageError
impl From<postcard::Error> for StorageError {
    fn from(err: postcard::Error) -> Self {
        StorageError::Deserialization(err.to_string())
    }
}

impl StorageError {
    /// Create a new NotFound error
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Create a new I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    /// Create a new Corrupt error
    pub fn corrupt(chunk: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            chunk: chunk.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Transform error
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform(message.into())
    }

    /// Whether the error means the on-disk log cannot be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupt { .. }
                | StorageError::HashMismatch { .. }
                | StorageError::ChainGap { .. }
        )
    }
}
