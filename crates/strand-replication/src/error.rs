//! Replication error types

use thiserror::Error;

use crate::leader::LeaderState;
use crate::tracker::ReplicaId;

/// Errors from quorum tracking and leadership
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    /// Replica id was never registered, or its slot has been reused
    #[error("Unknown replica: {0}")]
    UnknownReplica(ReplicaId),

    /// Leader state machine asked to make a transition it does not allow
    #[error("Illegal leader transition from {from:?} to {to:?}")]
    IllegalTransition { from: LeaderState, to: LeaderState },

    /// Quorum size cannot be met by the configured cluster
    #[error("Invalid quorum: {quorum_size} of {cluster_size} nodes")]
    InvalidQuorum {
        quorum_size: usize,
        cluster_size: usize,
    },

    /// Write cannot be acknowledged because this node is not an active leader
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Notification channel closed
    #[error("Replication closed")]
    Closed,
}

impl ReplicationError {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady(reason.into())
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;
