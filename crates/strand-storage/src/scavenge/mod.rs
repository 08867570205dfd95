//! Scavenging
//!
//! Rewrites completed chunks without the records that are no longer
//! needed, optionally merges small scavenged chunks, and records every run
//! in a durable history log.

mod log;
mod scavenger;
mod service;

pub use log::{RESTART_REASON, ScavengeLog, ScavengeLogEntry, ScavengeRecord};
pub use scavenger::Scavenger;
pub use service::ScavengeService;

use serde::{Deserialize, Serialize};

/// Options for a single scavenge run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengeOptions {
    /// Skip chunks numbered below this
    pub start_from_chunk: i32,
    /// Keep the rewritten chunk even when it is not smaller
    pub always_keep_scavenged: bool,
    /// Merge adjacent chunks that fit into one after scavenging
    pub merge_chunks: bool,
}

impl ScavengeOptions {
    pub fn with_start_from_chunk(mut self, chunk: i32) -> Self {
        self.start_from_chunk = chunk;
        self
    }

    pub fn with_always_keep_scavenged(mut self, keep: bool) -> Self {
        self.always_keep_scavenged = keep;
        self
    }

    pub fn with_merge_chunks(mut self, merge: bool) -> Self {
        self.merge_chunks = merge;
        self
    }
}

/// State of a scavenge run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScavengeStatus {
    Started,
    InProgress,
    Success,
    Stopped,
    Failed,
}

impl ScavengeStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ScavengeStatus::Success | ScavengeStatus::Stopped | ScavengeStatus::Failed
        )
    }
}

/// Final outcome of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengeSummary {
    pub scavenge_id: String,
    pub status: ScavengeStatus,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    /// Bytes reclaimed across all rewritten chunks
    pub space_saved: i64,
    /// Highest chunk number processed, `-1` if none
    pub max_chunk_scavenged: i32,
}
