//! Configuration for a Strand node

use std::path::PathBuf;
use std::time::Duration;

use strand_replication::ReplicationConfig;
use strand_storage::{DbConfig, ScavengeLogConfig};

/// Configuration for a [`crate::Node`]
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Endpoint this node is known by in the cluster
    pub node_endpoint: String,
    /// Base directory for all node data
    pub data_dir: PathBuf,
    /// Chunk database configuration
    pub db: DbConfig,
    /// Quorum and liveness settings
    pub replication: ReplicationConfig,
    /// Scavenge history configuration
    pub scavenge_log: ScavengeLogConfig,
    /// How long a promotion waits for enough replicas to connect
    pub promotion_timeout: Duration,
    /// Period of the replica liveness sweep
    pub liveness_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::with_data_dir("./strand-data")
    }
}

impl NodeConfig {
    /// Create a configuration with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let db_dir = data_dir.join("db");
        Self {
            node_endpoint: "127.0.0.1:1112".to_string(),
            data_dir,
            db: DbConfig::new(&db_dir),
            replication: ReplicationConfig::default(),
            scavenge_log: ScavengeLogConfig::new(&db_dir),
            promotion_timeout: Duration::from_secs(5),
            liveness_interval: Duration::from_millis(500),
        }
    }

    /// Set the node endpoint
    pub fn with_node_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.node_endpoint = endpoint.into();
        self
    }

    /// Set the database configuration
    pub fn with_db(mut self, db: DbConfig) -> Self {
        self.db = db;
        self
    }

    /// Set the replication configuration
    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = replication;
        self
    }

    /// Set the scavenge log configuration
    pub fn with_scavenge_log(mut self, scavenge_log: ScavengeLogConfig) -> Self {
        self.scavenge_log = scavenge_log;
        self
    }

    pub fn with_promotion_timeout(mut self, timeout: Duration) -> Self {
        self.promotion_timeout = timeout;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Check settings that cannot be fixed up at runtime
    pub fn validate(&self) -> Result<(), String> {
        if self.node_endpoint.is_empty() {
            return Err("node endpoint must not be empty".to_string());
        }
        if self.db.chunk_size <= 0 {
            return Err(format!("chunk size must be positive, got {}", self.db.chunk_size));
        }
        if self.liveness_interval.is_zero() {
            return Err("liveness interval must be non-zero".to_string());
        }
        // The node's own ack is refreshed once per sweep
        if self.liveness_interval >= self.replication.ack_timeout {
            return Err(format!(
                "liveness interval {:?} must be shorter than the ack timeout {:?}",
                self.liveness_interval, self.replication.ack_timeout
            ));
        }
        self.replication.validate().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_layout() {
        let config = NodeConfig::with_data_dir("/tmp/strand");
        assert_eq!(config.db.path, PathBuf::from("/tmp/strand/db"));
        assert_eq!(config.scavenge_log.path, PathBuf::from("/tmp/strand/db"));
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_validate_rejects_bad_quorum() {
        let config = NodeConfig::default()
            .with_replication(ReplicationConfig::new(3).with_quorum_size(4));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_endpoint() {
        let config = NodeConfig::default().with_node_endpoint("");
        assert!(config.validate().is_err());
    }
}
