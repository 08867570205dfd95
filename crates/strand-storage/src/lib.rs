//! # Strand Storage
//!
//! Chunked transaction log storage.
//!
//! The log is an append-only sequence of fixed-size chunk files. Durability
//! points live in named checkpoints, and completed chunks can be rewritten
//! by the scavenger to drop records that retention rules no longer need.
//!
//! ## Features
//!
//! - **Chunk**: Self-describing file with header, framed records, position map and footer
//! - **ChunkTransform**: Per-chunk frame transform (identity, checksum, deflate, encrypted)
//! - **CheckpointStore**: Writer, chaser, epoch, truncate and replication positions
//! - **ChunkManager**: Ordered chain of chunks with atomic switch-in of rewritten ones
//! - **ChunkDb**: Recovery, append with rollover, truncation and bounded reads
//! - **ScavengeService**: One-at-a-time background scavenging with a durable history
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_core::PrepareRecord;
//! use strand_storage::{ChunkDb, DbConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let db = ChunkDb::open(DbConfig::new("/var/lib/strand")).await.unwrap();
//!
//!     let event = PrepareRecord::new("orders", -1, "OrderPlaced", &b"{}"[..]);
//!     let result = db.append(vec![event.into()]).await.unwrap();
//!
//!     let record = db.read_at(result.positions[0]).await.unwrap();
//!     assert_eq!(record.position(), result.positions[0]);
//! }
//! ```

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod manager;
pub mod scavenge;

// Re-exports
pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointStore};
pub use chunk::format::{ChunkFooter, ChunkHeader, PosMap};
pub use chunk::naming::ChunkNaming;
pub use chunk::transform::{ChunkTransform, EncryptionKey, TransformConfig, TransformKind};
pub use chunk::{Chunk, ChunkAppend};
pub use config::{DbConfig, ScavengeLogConfig};
pub use db::{AppendResult, ChunkDb};
pub use error::StorageError;
pub use index::{DELETED_STREAM, ScavengeIndex, StreamIndex};
pub use manager::ChunkManager;
pub use scavenge::{
    RESTART_REASON, ScavengeLog, ScavengeLogEntry, ScavengeOptions, ScavengeRecord, ScavengeService,
    ScavengeStatus, ScavengeSummary, Scavenger,
};
