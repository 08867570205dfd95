//! # Strand Replication
//!
//! Leader-side replication bookkeeping for the Strand transaction log.
//!
//! Storage-agnostic: the node feeds replica acks in and drives leader
//! promotion, this crate decides when positions are committed and who is
//! waiting on them.
//!
//! ## Core Components
//!
//! - [`QuorumTracker`]: Per-replica ack positions and the quorum commit position
//! - [`LeaderStateMachine`]: Ordered promotion from `Idle` to `Active`
//! - [`WriteCompletion`]: Releases waiting writers as the commit position advances
//!
//! ## Example
//!
//! ```rust,ignore
//! use strand_replication::{QuorumTracker, ReplicationConfig};
//!
//! let tracker = QuorumTracker::new(ReplicationConfig::new(3))?;
//! let a = tracker.register_replica("10.0.0.1:1112", true);
//! let b = tracker.register_replica("10.0.0.2:1112", true);
//! tracker.set_leading(true);
//!
//! tracker.ack(a, 4000)?;
//! tracker.ack(b, 4000)?;
//! assert_eq!(tracker.published_position(), 4000);
//! ```

pub mod completion;
pub mod config;
pub mod error;
pub mod leader;
pub mod tracker;

pub use completion::WriteCompletion;
pub use config::ReplicationConfig;
pub use error::{ReplicationError, ReplicationResult};
pub use leader::{LeaderEpoch, LeaderState, LeaderStateMachine};
pub use tracker::{QuorumTracker, ReplicaId, ReplicaInfo, ReplicationEvent};
