//! Scavenge history log
//!
//! Append-only `scavenges.log` of length-prefixed postcard entries. Every
//! run writes a `Started` entry, one entry per chunk processed, and a
//! `Completed` entry. Runs left without a `Completed` entry by a crash are
//! closed as failed when the log is initialised.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::ScavengeLogConfig;
use crate::error::StorageError;
use crate::scavenge::{ScavengeOptions, ScavengeStatus, ScavengeSummary};

const LOG_FILE_NAME: &str = "scavenges.log";
const MAX_ENTRY_SIZE: usize = 1024 * 1024;

/// Reason recorded for runs interrupted by a restart
pub const RESTART_REASON: &str = "The node was restarted.";

/// A single entry in the scavenge log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScavengeLogEntry {
    Started {
        scavenge_id: String,
        node_endpoint: String,
        timestamp_millis: i64,
        options: ScavengeOptions,
    },
    ChunksScavenged {
        scavenge_id: String,
        timestamp_millis: i64,
        chunk_start: i32,
        chunk_end: i32,
        elapsed_ms: u64,
        space_saved: i64,
    },
    ChunksNotScavenged {
        scavenge_id: String,
        timestamp_millis: i64,
        chunk_start: i32,
        chunk_end: i32,
        elapsed_ms: u64,
        reason: String,
    },
    ChunksMerged {
        scavenge_id: String,
        timestamp_millis: i64,
        chunk_start: i32,
        chunk_end: i32,
        elapsed_ms: u64,
        space_saved: i64,
    },
    Completed {
        scavenge_id: String,
        node_endpoint: String,
        timestamp_millis: i64,
        result: ScavengeStatus,
        error: Option<String>,
        elapsed_ms: u64,
        space_saved: i64,
        max_chunk_scavenged: i32,
    },
}

impl ScavengeLogEntry {
    pub fn scavenge_id(&self) -> &str {
        match self {
            Self::Started { scavenge_id, .. }
            | Self::ChunksScavenged { scavenge_id, .. }
            | Self::ChunksNotScavenged { scavenge_id, .. }
            | Self::ChunksMerged { scavenge_id, .. }
            | Self::Completed { scavenge_id, .. } => scavenge_id,
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        match self {
            Self::Started { timestamp_millis, .. }
            | Self::ChunksScavenged { timestamp_millis, .. }
            | Self::ChunksNotScavenged { timestamp_millis, .. }
            | Self::ChunksMerged { timestamp_millis, .. }
            | Self::Completed { timestamp_millis, .. } => *timestamp_millis,
        }
    }
}

/// Folded view of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengeRecord {
    pub scavenge_id: String,
    pub node_endpoint: String,
    pub started_at_millis: i64,
    pub status: ScavengeStatus,
    pub error: Option<String>,
    pub chunks_scavenged: u32,
    pub chunks_not_scavenged: u32,
    pub chunks_merged: u32,
    pub space_saved: i64,
    pub elapsed_ms: Option<u64>,
    pub max_chunk_scavenged: Option<i32>,
}

impl ScavengeRecord {
    fn apply(&mut self, entry: &ScavengeLogEntry) {
        match entry {
            ScavengeLogEntry::Started { .. } => {}
            ScavengeLogEntry::ChunksScavenged { space_saved, .. } => {
                self.status = ScavengeStatus::InProgress;
                self.chunks_scavenged += 1;
                self.space_saved += space_saved;
            }
            ScavengeLogEntry::ChunksNotScavenged { .. } => {
                self.status = ScavengeStatus::InProgress;
                self.chunks_not_scavenged += 1;
            }
            ScavengeLogEntry::ChunksMerged { space_saved, .. } => {
                self.status = ScavengeStatus::InProgress;
                self.chunks_merged += 1;
                self.space_saved += space_saved;
            }
            ScavengeLogEntry::Completed {
                result,
                error,
                elapsed_ms,
                space_saved,
                max_chunk_scavenged,
                ..
            } => {
                self.status = *result;
                self.error = error.clone();
                self.elapsed_ms = Some(*elapsed_ms);
                self.space_saved = *space_saved;
                self.max_chunk_scavenged = Some(*max_chunk_scavenged);
            }
        }
    }
}

/// The durable scavenge history
pub struct ScavengeLog {
    config: ScavengeLogConfig,
    log_path: PathBuf,
    file: RwLock<Option<File>>,
    entries: RwLock<Vec<ScavengeLogEntry>>,
}

impl ScavengeLog {
    /// Open the log, replaying it and dropping runs older than the
    /// configured retention
    #[instrument(skip_all, fields(path = %config.path.display()))]
    pub async fn open(config: ScavengeLogConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path).await?;
        let log_path = config.path.join(LOG_FILE_NAME);

        let entries = if tokio::fs::try_exists(&log_path).await? {
            replay(&log_path).await?
        } else {
            Vec::new()
        };

        let retained = apply_retention(&entries, config.max_age, chrono::Utc::now().timestamp_millis());
        if retained.len() != entries.len() {
            info!(
                dropped = entries.len() - retained.len(),
                "Compacting scavenge log"
            );
            rewrite(&log_path, &retained).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        debug!(entries = retained.len(), "Scavenge log opened");
        Ok(Self {
            config,
            log_path,
            file: RwLock::new(Some(file)),
            entries: RwLock::new(retained),
        })
    }

    /// Close every run this node left open as failed
    ///
    /// Returns the ids that were closed.
    pub async fn initialise(&self, node_endpoint: &str) -> Result<Vec<String>, StorageError> {
        let orphaned: Vec<String> = {
            let entries = self.entries.read().await;
            let mut open: Vec<String> = Vec::new();
            for entry in entries.iter() {
                match entry {
                    ScavengeLogEntry::Started {
                        scavenge_id,
                        node_endpoint: node,
                        ..
                    } if node == node_endpoint => open.push(scavenge_id.clone()),
                    ScavengeLogEntry::Completed { scavenge_id, .. } => {
                        open.retain(|id| id != scavenge_id)
                    }
                    _ => {}
                }
            }
            open
        };

        for scavenge_id in &orphaned {
            warn!(scavenge_id = %scavenge_id, "Marking interrupted scavenge as failed");
            let record = self.get(scavenge_id).await;
            self.append(ScavengeLogEntry::Completed {
                scavenge_id: scavenge_id.clone(),
                node_endpoint: node_endpoint.to_string(),
                timestamp_millis: chrono::Utc::now().timestamp_millis(),
                result: ScavengeStatus::Failed,
                error: Some(RESTART_REASON.to_string()),
                elapsed_ms: 0,
                space_saved: record.as_ref().map(|r| r.space_saved).unwrap_or(0),
                max_chunk_scavenged: -1,
            })
            .await?;
        }
        Ok(orphaned)
    }

    pub async fn scavenge_started(
        &self,
        scavenge_id: &str,
        node_endpoint: &str,
        options: &ScavengeOptions,
    ) -> Result<(), StorageError> {
        self.append(ScavengeLogEntry::Started {
            scavenge_id: scavenge_id.to_string(),
            node_endpoint: node_endpoint.to_string(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            options: options.clone(),
        })
        .await
    }

    pub async fn chunks_scavenged(
        &self,
        scavenge_id: &str,
        chunk_start: i32,
        chunk_end: i32,
        elapsed: Duration,
        space_saved: i64,
    ) -> Result<(), StorageError> {
        self.append(ScavengeLogEntry::ChunksScavenged {
            scavenge_id: scavenge_id.to_string(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            chunk_start,
            chunk_end,
            elapsed_ms: elapsed.as_millis() as u64,
            space_saved,
        })
        .await
    }

    pub async fn chunks_not_scavenged(
        &self,
        scavenge_id: &str,
        chunk_start: i32,
        chunk_end: i32,
        elapsed: Duration,
        reason: impl Into<String>,
    ) -> Result<(), StorageError> {
        self.append(ScavengeLogEntry::ChunksNotScavenged {
            scavenge_id: scavenge_id.to_string(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            chunk_start,
            chunk_end,
            elapsed_ms: elapsed.as_millis() as u64,
            reason: reason.into(),
        })
        .await
    }

    pub async fn chunks_merged(
        &self,
        scavenge_id: &str,
        chunk_start: i32,
        chunk_end: i32,
        elapsed: Duration,
        space_saved: i64,
    ) -> Result<(), StorageError> {
        self.append(ScavengeLogEntry::ChunksMerged {
            scavenge_id: scavenge_id.to_string(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            chunk_start,
            chunk_end,
            elapsed_ms: elapsed.as_millis() as u64,
            space_saved,
        })
        .await
    }

    pub async fn scavenge_completed(
        &self,
        node_endpoint: &str,
        summary: &ScavengeSummary,
    ) -> Result<(), StorageError> {
        self.append(ScavengeLogEntry::Completed {
            scavenge_id: summary.scavenge_id.clone(),
            node_endpoint: node_endpoint.to_string(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            result: summary.status,
            error: summary.error.clone(),
            elapsed_ms: summary.elapsed_ms,
            space_saved: summary.space_saved,
            max_chunk_scavenged: summary.max_chunk_scavenged,
        })
        .await
    }

    async fn append(&self, entry: ScavengeLogEntry) -> Result<(), StorageError> {
        let serialized =
            postcard::to_allocvec(&entry).map_err(|e| StorageError::serialization(e.to_string()))?;

        let mut file_guard = self.file.write().await;
        let file = file_guard
            .as_mut()
            .ok_or_else(|| StorageError::io("Scavenge log not open"))?;

        let len_bytes = (serialized.len() as u32).to_be_bytes();
        file.write_all(&len_bytes).await?;
        file.write_all(&serialized).await?;
        file.flush().await?;
        if self.config.sync_on_write {
            file.sync_data().await?;
        }

        self.entries.write().await.push(entry);
        Ok(())
    }

    /// Every run, most recent first
    pub async fn history(&self) -> Vec<ScavengeRecord> {
        let entries = self.entries.read().await;
        let mut order: Vec<String> = Vec::new();
        let mut records: HashMap<String, ScavengeRecord> = HashMap::new();
        for entry in entries.iter() {
            if let ScavengeLogEntry::Started {
                scavenge_id,
                node_endpoint,
                timestamp_millis,
                ..
            } = entry
            {
                order.push(scavenge_id.clone());
                records.insert(
                    scavenge_id.clone(),
                    ScavengeRecord {
                        scavenge_id: scavenge_id.clone(),
                        node_endpoint: node_endpoint.clone(),
                        started_at_millis: *timestamp_millis,
                        status: ScavengeStatus::Started,
                        error: None,
                        chunks_scavenged: 0,
                        chunks_not_scavenged: 0,
                        chunks_merged: 0,
                        space_saved: 0,
                        elapsed_ms: None,
                        max_chunk_scavenged: None,
                    },
                );
            } else if let Some(record) = records.get_mut(entry.scavenge_id()) {
                record.apply(entry);
            }
        }
        order
            .into_iter()
            .rev()
            .filter_map(|id| records.remove(&id))
            .collect()
    }

    /// A single run
    pub async fn get(&self, scavenge_id: &str) -> Option<ScavengeRecord> {
        self.history()
            .await
            .into_iter()
            .find(|r| r.scavenge_id == scavenge_id)
    }

    /// Raw entries in log order
    pub async fn entries(&self) -> Vec<ScavengeLogEntry> {
        self.entries.read().await.clone()
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }

    pub async fn close(&self) {
        self.file.write().await.take();
    }
}

async fn replay(path: &PathBuf) -> Result<Vec<ScavengeLogEntry>, StorageError> {
    let file = File::open(path).await?;
    let file_size = file.metadata().await?.len();
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset = 0u64;

    while offset < file_size {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            warn!(offset, "Truncated scavenge log entry, stopping replay");
            break;
        }
        let entry_len = u32::from_be_bytes(len_buf) as usize;
        if entry_len == 0 || entry_len > MAX_ENTRY_SIZE {
            warn!(offset, len = entry_len, "Invalid scavenge log entry length");
            break;
        }

        let mut entry_buf = vec![0u8; entry_len];
        if reader.read_exact(&mut entry_buf).await.is_err() {
            warn!(offset, "Failed to read scavenge log entry, stopping replay");
            break;
        }
        match postcard::from_bytes::<ScavengeLogEntry>(&entry_buf) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(offset, error = %e, "Failed to deserialize scavenge log entry");
                break;
            }
        }
        offset += 4 + entry_len as u64;
    }

    debug!(entries = entries.len(), "Replayed scavenge log");
    Ok(entries)
}

/// Keep runs started within `max_age`, and always the most recent run
fn apply_retention(entries: &[ScavengeLogEntry], max_age: Duration, now_millis: i64) -> Vec<ScavengeLogEntry> {
    let cutoff = now_millis - max_age.as_millis() as i64;
    let mut started_at: HashMap<&str, i64> = HashMap::new();
    let mut latest: Option<&str> = None;
    for entry in entries {
        if let ScavengeLogEntry::Started {
            scavenge_id,
            timestamp_millis,
            ..
        } = entry
        {
            started_at.insert(scavenge_id.as_str(), *timestamp_millis);
            latest = Some(scavenge_id.as_str());
        }
    }

    entries
        .iter()
        .filter(|entry| {
            let id = entry.scavenge_id();
            if latest == Some(id) {
                return true;
            }
            let started = started_at
                .get(id)
                .copied()
                .unwrap_or_else(|| entry.timestamp_millis());
            started >= cutoff
        })
        .cloned()
        .collect()
}

/// Atomically replace the log with `entries`
async fn rewrite(path: &PathBuf, entries: &[ScavengeLogEntry]) -> Result<(), StorageError> {
    let temp_path = path.with_extension("log.tmp");
    let mut buf = Vec::new();
    for entry in entries {
        let serialized =
            postcard::to_allocvec(entry).map_err(|e| StorageError::serialization(e.to_string()))?;
        buf.extend_from_slice(&(serialized.len() as u32).to_be_bytes());
        buf.extend_from_slice(&serialized);
    }

    let mut file = File::create(&temp_path).await?;
    file.write_all(&buf).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn summary(id: &str, status: ScavengeStatus) -> ScavengeSummary {
        ScavengeSummary {
            scavenge_id: id.to_string(),
            status,
            error: None,
            elapsed_ms: 12,
            space_saved: 4096,
            max_chunk_scavenged: 3,
        }
    }

    #[tokio::test]
    async fn test_history_folds_entries() {
        let dir = TempDir::new().unwrap();
        let log = ScavengeLog::open(ScavengeLogConfig::new(dir.path())).await.unwrap();

        log.scavenge_started("a", "node-1", &ScavengeOptions::default()).await.unwrap();
        log.chunks_scavenged("a", 0, 0, Duration::from_millis(5), 1000).await.unwrap();
        log.chunks_not_scavenged("a", 1, 1, Duration::from_millis(5), "not smaller").await.unwrap();

        let running = log.get("a").await.unwrap();
        assert_eq!(running.status, ScavengeStatus::InProgress);
        assert_eq!(running.chunks_scavenged, 1);
        assert_eq!(running.chunks_not_scavenged, 1);

        log.scavenge_completed("node-1", &summary("a", ScavengeStatus::Success)).await.unwrap();
        let done = log.get("a").await.unwrap();
        assert_eq!(done.status, ScavengeStatus::Success);
        assert_eq!(done.space_saved, 4096);
        assert_eq!(done.max_chunk_scavenged, Some(3));
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let log = ScavengeLog::open(ScavengeLogConfig::new(dir.path())).await.unwrap();
            log.scavenge_started("a", "node-1", &ScavengeOptions::default()).await.unwrap();
            log.scavenge_completed("node-1", &summary("a", ScavengeStatus::Stopped)).await.unwrap();
            log.scavenge_started("b", "node-1", &ScavengeOptions::default()).await.unwrap();
        }
        let log = ScavengeLog::open(ScavengeLogConfig::new(dir.path())).await.unwrap();
        let history = log.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].scavenge_id, "b");
        assert_eq!(history[1].status, ScavengeStatus::Stopped);
    }

    #[tokio::test]
    async fn test_initialise_fails_orphaned_runs_of_this_node_only() {
        let dir = TempDir::new().unwrap();
        let log = ScavengeLog::open(ScavengeLogConfig::new(dir.path())).await.unwrap();
        log.scavenge_started("mine", "node-1", &ScavengeOptions::default()).await.unwrap();
        log.scavenge_started("theirs", "node-2", &ScavengeOptions::default()).await.unwrap();
        log.scavenge_started("done", "node-1", &ScavengeOptions::default()).await.unwrap();
        log.scavenge_completed("node-1", &summary("done", ScavengeStatus::Success)).await.unwrap();

        let closed = log.initialise("node-1").await.unwrap();
        assert_eq!(closed, vec!["mine".to_string()]);

        let mine = log.get("mine").await.unwrap();
        assert_eq!(mine.status, ScavengeStatus::Failed);
        assert_eq!(mine.error.as_deref(), Some(RESTART_REASON));
        assert_eq!(log.get("theirs").await.unwrap().status, ScavengeStatus::Started);

        assert!(log.initialise("node-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        {
            let log = ScavengeLog::open(ScavengeLogConfig::new(dir.path())).await.unwrap();
            log.scavenge_started("a", "node-1", &ScavengeOptions::default()).await.unwrap();
        }
        let path = dir.path().join(LOG_FILE_NAME);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 50, 1, 2]);
        std::fs::write(&path, &bytes).unwrap();

        let log = ScavengeLog::open(ScavengeLogConfig::new(dir.path())).await.unwrap();
        assert_eq!(log.history().await.len(), 1);
    }

    #[test]
    fn test_retention_keeps_latest_run() {
        let day = 24 * 60 * 60 * 1000;
        let now = 100 * day;
        let started = |id: &str, at: i64| ScavengeLogEntry::Started {
            scavenge_id: id.to_string(),
            node_endpoint: "n".to_string(),
            timestamp_millis: at,
            options: ScavengeOptions::default(),
        };
        let merged = |id: &str, at: i64| ScavengeLogEntry::ChunksMerged {
            scavenge_id: id.to_string(),
            timestamp_millis: at,
            chunk_start: 0,
            chunk_end: 1,
            elapsed_ms: 1,
            space_saved: 1,
        };
        let entries = vec![
            started("old", now - 40 * day),
            // Belongs to the old run even though it is recent
            merged("old", now - day),
            started("older-latest", now - 35 * day),
            started("fresh", now - day),
        ];

        let kept = apply_retention(&entries, Duration::from_millis(30 * day as u64), now);
        let ids: Vec<&str> = kept.iter().map(|e| e.scavenge_id()).collect();
        assert_eq!(ids, vec!["fresh"]);

        let only_old = vec![started("old", now - 40 * day)];
        assert_eq!(
            apply_retention(&only_old, Duration::from_millis(30 * day as u64), now).len(),
            1
        );
    }
}
