//! Error types for the node facade

use strand_replication::LeaderState;
use thiserror::Error;

/// Errors that can occur in node operations
#[derive(Debug, Error)]
pub enum NodeError {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] strand_storage::StorageError),

    /// Replication error
    #[error("Replication error: {0}")]
    Replication(#[from] strand_replication::ReplicationError),

    /// Record or metadata encoding error
    #[error("Encoding error: {0}")]
    Core(#[from] strand_core::CoreError),

    /// The stream's version did not match the writer's expectation
    #[error("Wrong expected version for stream {stream}: expected {expected}, current {current}")]
    WrongExpectedVersion {
        stream: String,
        expected: i64,
        current: i64,
    },

    /// The stream has been deleted
    #[error("Stream {0} is deleted")]
    StreamDeleted(String),

    /// Operation requires leadership
    #[error("Node is not leader (state {0:?})")]
    NotLeader(LeaderState),

    /// Promotion gave up waiting for replicas
    #[error("Promotion timed out: {connected} of {required} promotable replicas connected")]
    PromotionTimedOut { connected: usize, required: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node has been closed
    #[error("Node is closed")]
    Closed,
}

/// Result type alias for node operations
pub type NodeResult<T> = Result<T, NodeError>;
