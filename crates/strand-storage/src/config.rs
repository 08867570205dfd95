//! Storage configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::chunk::naming::DEFAULT_CHUNK_PREFIX;
use crate::chunk::transform::TransformConfig;

/// Configuration for a chunk database
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Directory holding chunk and checkpoint files
    pub path: PathBuf,
    /// Logical bytes per chunk
    pub chunk_size: i32,
    /// Prefix of chunk file names
    pub chunk_prefix: String,
    /// Keep checkpoints in memory only
    pub in_memory_checkpoints: bool,
    /// Re-hash completed chunks at startup
    pub verify_hashes: bool,
    /// Flush data and checkpoints after every append
    pub sync_on_write: bool,
    /// Concurrent readers per chunk
    pub max_readers_per_chunk: usize,
    /// Transform applied to newly created chunks
    pub transform: TransformConfig,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/db"),
            chunk_size: 256 * 1024 * 1024, // 256MB
            chunk_prefix: DEFAULT_CHUNK_PREFIX.to_string(),
            in_memory_checkpoints: false,
            verify_hashes: true,
            sync_on_write: true,
            max_readers_per_chunk: 5,
            transform: TransformConfig::default(),
        }
    }
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: i32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_verify_hashes(mut self, verify: bool) -> Self {
        self.verify_hashes = verify;
        self
    }

    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    pub fn with_in_memory_checkpoints(mut self, in_memory: bool) -> Self {
        self.in_memory_checkpoints = in_memory;
        self
    }

    pub fn with_transform(mut self, transform: TransformConfig) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_max_readers_per_chunk(mut self, readers: usize) -> Self {
        self.max_readers_per_chunk = readers;
        self
    }
}

/// Configuration for the scavenge history log
#[derive(Debug, Clone)]
pub struct ScavengeLogConfig {
    /// Directory holding `scavenges.log`
    pub path: PathBuf,
    /// Runs that started longer ago are dropped on open
    pub max_age: Duration,
    /// Sync every entry to disk
    pub sync_on_write: bool,
}

impl Default for ScavengeLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/db"),
            max_age: Duration::from_secs(30 * 24 * 60 * 60), // 30 days
            sync_on_write: true,
        }
    }
}

impl ScavengeLogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }
}
