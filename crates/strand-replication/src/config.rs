//! Replication configuration

use std::time::Duration;

use crate::error::{ReplicationError, ReplicationResult};

/// Quorum and liveness settings for one cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    /// Number of nodes in the cluster, including this one
    pub cluster_size: usize,
    /// Promotable replicas that must ack a position before it commits
    pub quorum_size: usize,
    /// A replica silent for longer than this is treated as disconnected
    pub ack_timeout: Duration,
    /// How long a leader may lack quorum before `NoQuorum` is reported
    pub no_quorum_timeout: Duration,
    /// Buffered replication events per subscriber
    pub notification_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ReplicationConfig {
    /// Majority quorum for a cluster of `cluster_size` nodes
    pub fn new(cluster_size: usize) -> Self {
        Self {
            cluster_size,
            quorum_size: cluster_size / 2 + 1,
            ack_timeout: Duration::from_secs(10),
            no_quorum_timeout: Duration::from_millis(3000),
            notification_capacity: 1024,
        }
    }

    pub fn with_quorum_size(mut self, quorum_size: usize) -> Self {
        self.quorum_size = quorum_size;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_no_quorum_timeout(mut self, timeout: Duration) -> Self {
        self.no_quorum_timeout = timeout;
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Reject quorums the cluster can never reach
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.quorum_size == 0 || self.quorum_size > self.cluster_size {
            return Err(ReplicationError::InvalidQuorum {
                quorum_size: self.quorum_size,
                cluster_size: self.cluster_size,
            });
        }
        Ok(())
    }
}
