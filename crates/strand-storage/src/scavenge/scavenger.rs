//! Chunk scavenger
//!
//! For every completed chunk behind the writer, decides per record whether
//! it is still needed, writes the survivors to a temp chunk and switches it
//! in when it is smaller. Stops cooperatively between chunks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use strand_core::{LogRecord, PrepareFlags, PrepareRecord};
use tracing::{debug, error, info, instrument, warn};

use crate::chunk::{Chunk, ChunkAppend, display_name};
use crate::db::ChunkDb;
use crate::error::StorageError;
use crate::index::{DELETED_STREAM, ScavengeIndex};
use crate::scavenge::{ScavengeLog, ScavengeOptions, ScavengeStatus, ScavengeSummary};

/// Whether a transaction's commit must survive
#[derive(Debug, Clone, Copy)]
struct CommitInfo {
    event_number: i64,
    keep: Option<bool>,
}

impl CommitInfo {
    fn forcibly_keep(&mut self) {
        self.keep = Some(true);
    }

    fn try_not_to_keep(&mut self) {
        self.keep = Some(self.keep.unwrap_or(false));
    }
}

enum ChunkOutcome {
    Scavenged { space_saved: i64 },
    NotScavenged { reason: String },
}

pub struct Scavenger {
    db: Arc<ChunkDb>,
    index: Arc<dyn ScavengeIndex>,
    log: Arc<ScavengeLog>,
    node_endpoint: String,
}

impl Scavenger {
    pub fn new(
        db: Arc<ChunkDb>,
        index: Arc<dyn ScavengeIndex>,
        log: Arc<ScavengeLog>,
        node_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            db,
            index,
            log,
            node_endpoint: node_endpoint.into(),
        }
    }

    /// Run a full scavenge and record it in the scavenge log
    #[instrument(skip(self, options, stop), fields(node = %self.node_endpoint))]
    pub async fn scavenge(
        &self,
        scavenge_id: &str,
        options: &ScavengeOptions,
        stop: &AtomicBool,
    ) -> ScavengeSummary {
        let started = Instant::now();
        let mut summary = ScavengeSummary {
            scavenge_id: scavenge_id.to_string(),
            status: ScavengeStatus::Success,
            error: None,
            elapsed_ms: 0,
            space_saved: 0,
            max_chunk_scavenged: -1,
        };

        match self
            .log
            .scavenge_started(scavenge_id, &self.node_endpoint, options)
            .await
        {
            Ok(()) => match self.run(scavenge_id, options, stop, &mut summary).await {
                Ok(status) => summary.status = status,
                Err(e) => {
                    error!(error = %e, "Error while scavenging database");
                    summary.status = ScavengeStatus::Failed;
                    summary.error = Some(format!("Error while scavenging database: {e}"));
                }
            },
            Err(e) => {
                error!(error = %e, "Could not record scavenge start");
                summary.status = ScavengeStatus::Failed;
                summary.error = Some(e.to_string());
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.log.scavenge_completed(&self.node_endpoint, &summary).await {
            error!(error = %e, status = ?summary.status, "Failed to record scavenge completion");
        }
        info!(
            status = ?summary.status,
            space_saved = summary.space_saved,
            elapsed_ms = summary.elapsed_ms,
            "Scavenge finished"
        );
        summary
    }

    async fn run(
        &self,
        scavenge_id: &str,
        options: &ScavengeOptions,
        stop: &AtomicBool,
        summary: &mut ScavengeSummary,
    ) -> Result<ScavengeStatus, StorageError> {
        let manager = self.db.manager();
        let tail = manager
            .last_chunk()
            .map(|c| c.start_number())
            .unwrap_or(0);
        let candidates: Vec<Arc<Chunk>> = manager
            .chunks()
            .into_iter()
            .filter(|c| {
                c.is_completed() && c.start_number() >= options.start_from_chunk && c.end_number() < tail
            })
            .collect();
        debug!(candidates = candidates.len(), tail, "Starting scavenge pass");

        for chunk in candidates {
            if stop.load(Ordering::Acquire) {
                info!("Scavenge stopped");
                return Ok(ScavengeStatus::Stopped);
            }
            let started = Instant::now();
            let (start, end) = (chunk.start_number(), chunk.end_number());
            match self
                .scavenge_chunk(&chunk, options.always_keep_scavenged)
                .await
            {
                Ok(ChunkOutcome::Scavenged { space_saved }) => {
                    summary.space_saved += space_saved;
                    self.log
                        .chunks_scavenged(scavenge_id, start, end, started.elapsed(), space_saved)
                        .await?;
                }
                Ok(ChunkOutcome::NotScavenged { reason }) => {
                    self.log
                        .chunks_not_scavenged(scavenge_id, start, end, started.elapsed(), reason)
                        .await?;
                }
                Err(e) => {
                    warn!(chunk = %display_name(chunk.path()), error = %e, "Failed to scavenge chunk");
                    self.log
                        .chunks_not_scavenged(scavenge_id, start, end, started.elapsed(), e.to_string())
                        .await?;
                }
            }
            summary.max_chunk_scavenged = summary.max_chunk_scavenged.max(end);
        }

        if options.merge_chunks {
            if let Some(status) = self.merge_phase(scavenge_id, tail, stop, summary).await? {
                return Ok(status);
            }
        }
        Ok(ScavengeStatus::Success)
    }

    async fn scavenge_chunk(
        &self,
        old: &Arc<Chunk>,
        always_keep: bool,
    ) -> Result<ChunkOutcome, StorageError> {
        let records = old.read_all_records().await?;
        let keep = self.decide(&records, old.start_position());
        let kept = keep.iter().filter(|k| **k).count();
        debug!(
            chunk = %display_name(old.path()),
            total = records.len(),
            kept,
            "Filtered chunk records"
        );

        let manager = self.db.manager();
        let temp = manager
            .create_temp_chunk(old.start_number(), old.end_number())
            .await?;
        for (record, keep) in records.iter().zip(keep) {
            if !keep {
                continue;
            }
            if let ChunkAppend::NoRoom { .. } = temp.append(record).await? {
                temp.mark_for_deletion();
                return Ok(ChunkOutcome::NotScavenged {
                    reason: "Scavenged records do not fit in a chunk".to_string(),
                });
            }
        }
        temp.complete_scavenged(old.logical_data_size()).await?;

        let old_size = old.file_size() as i64;
        let new_size = temp.file_size() as i64;
        if new_size >= old_size && !always_keep {
            info!(
                chunk = %display_name(old.path()),
                old_size,
                new_size,
                "Scavenged chunk is not smaller, keeping the old one"
            );
            temp.mark_for_deletion();
            return Ok(ChunkOutcome::NotScavenged {
                reason: format!("Old chunk size {old_size}, scavenged chunk size {new_size}"),
            });
        }

        match manager.switch_chunk(temp, self.db.config().verify_hashes).await? {
            Some(_) => {
                info!(
                    chunk = %display_name(old.path()),
                    old_size,
                    new_size,
                    "Scavenged chunk"
                );
                Ok(ChunkOutcome::Scavenged {
                    space_saved: old_size - new_size,
                })
            }
            None => Ok(ChunkOutcome::NotScavenged {
                reason: "Chunk was replaced during scavenge".to_string(),
            }),
        }
    }

    /// Keep/drop decision for every record, in order
    fn decide(&self, records: &[LogRecord], chunk_start: i64) -> Vec<bool> {
        let mut commits: HashMap<i64, CommitInfo> = HashMap::new();
        for record in records {
            if let LogRecord::Commit(commit) = record {
                if commit.transaction_position >= chunk_start {
                    commits.insert(
                        commit.transaction_position,
                        CommitInfo {
                            event_number: commit.first_event_number,
                            keep: None,
                        },
                    );
                }
            }
        }

        let mut decisions: Vec<bool> = records
            .iter()
            .map(|record| match record {
                LogRecord::Prepare(prepare) => self.should_keep_prepare(prepare, &mut commits),
                // Decided once every prepare has voted
                LogRecord::Commit(_) => true,
                LogRecord::System(_) => true,
            })
            .collect();

        for (record, decision) in records.iter().zip(decisions.iter_mut()) {
            if let LogRecord::Commit(commit) = record {
                *decision = commits
                    .get(&commit.transaction_position)
                    .is_none_or(|info| info.keep != Some(false));
            }
        }
        decisions
    }

    fn should_keep_prepare(
        &self,
        prepare: &PrepareRecord,
        commits: &mut HashMap<i64, CommitInfo>,
    ) -> bool {
        let mut commit = commits.get_mut(&prepare.transaction_position);
        let is_committed = commit.is_some() || prepare.is_committed();

        if prepare.is_tombstone() {
            if let Some(info) = commit.as_deref_mut() {
                info.forcibly_keep();
            }
            return true;
        }

        // The first prepare of an open transaction is needed to commit it
        if !is_committed && prepare.flags.contains(PrepareFlags::TRANSACTION_BEGIN) {
            return true;
        }

        let last_event_number = self.index.last_event_number(&prepare.stream_id);
        if last_event_number == DELETED_STREAM {
            if let Some(info) = commit.as_deref_mut() {
                info.try_not_to_keep();
            }
            return false;
        }

        if !is_committed {
            return true;
        }

        if !prepare.has_data() {
            if let Some(info) = commit.as_deref_mut() {
                info.try_not_to_keep();
            }
            return false;
        }

        let event_number = if prepare.is_committed() {
            prepare.expected_version + 1
        } else {
            match commit.as_deref() {
                Some(info) => info.event_number + prepare.transaction_offset as i64,
                None => return true,
            }
        };

        let is_duplicate = self
            .index
            .event_position(&prepare.stream_id, event_number)
            .is_some_and(|position| position != prepare.log_position);
        if is_duplicate {
            if let Some(info) = commit.as_deref_mut() {
                info.try_not_to_keep();
            }
            return false;
        }

        // The last event of a stream is always kept
        if event_number >= last_event_number {
            if let Some(info) = commit.as_deref_mut() {
                info.forcibly_keep();
            }
            return true;
        }

        let metadata = self.index.stream_metadata(&prepare.stream_id);
        let now = chrono::Utc::now().timestamp_millis();
        let can_remove = metadata
            .max_count
            .is_some_and(|max_count| event_number < last_event_number - max_count + 1)
            || metadata
                .truncate_before
                .is_some_and(|before| event_number < before)
            || metadata
                .max_age_ms
                .is_some_and(|max_age| prepare.timestamp_millis < now - max_age);

        if let Some(info) = commit.as_deref_mut() {
            if can_remove {
                info.try_not_to_keep();
            } else {
                info.forcibly_keep();
            }
        }
        !can_remove
    }

    /// Merge adjacent scavenged chunks while their data fits one chunk
    ///
    /// Returns `Some` if the run was stopped.
    async fn merge_phase(
        &self,
        scavenge_id: &str,
        tail: i32,
        stop: &AtomicBool,
        summary: &mut ScavengeSummary,
    ) -> Result<Option<ScavengeStatus>, StorageError> {
        let manager = self.db.manager();
        let max_data = self.db.chunk_size();
        let mut pass = 0;

        loop {
            pass += 1;
            let mut merged_something = false;
            let mut group: Vec<Arc<Chunk>> = Vec::new();
            let mut group_size = 0i64;

            let chunks: Vec<Arc<Chunk>> = manager
                .chunks()
                .into_iter()
                .filter(|c| c.is_completed() && c.end_number() < tail)
                .collect();

            for chunk in chunks {
                if stop.load(Ordering::Acquire) {
                    return Ok(Some(ScavengeStatus::Stopped));
                }
                if group_size + chunk.physical_data_size() > max_data {
                    if group.len() > 1 {
                        merged_something |= self.merge_group(scavenge_id, &group, summary).await?;
                    }
                    group.clear();
                    group_size = 0;
                }
                group_size += chunk.physical_data_size();
                group.push(chunk);
            }
            if group.len() > 1 {
                merged_something |= self.merge_group(scavenge_id, &group, summary).await?;
            }

            debug!(pass, merged_something, "Merge pass completed");
            if !merged_something {
                return Ok(None);
            }
        }
    }

    async fn merge_group(
        &self,
        scavenge_id: &str,
        group: &[Arc<Chunk>],
        summary: &mut ScavengeSummary,
    ) -> Result<bool, StorageError> {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            return Ok(false);
        };
        let started = Instant::now();
        let (start, end) = (first.start_number(), last.end_number());

        match self.write_merged(group).await {
            Ok(Some(space_saved)) => {
                summary.space_saved += space_saved;
                self.log
                    .chunks_merged(scavenge_id, start, end, started.elapsed(), space_saved)
                    .await?;
                info!(start, end, space_saved, "Merged chunks");
                Ok(true)
            }
            Ok(None) => {
                self.log
                    .chunks_not_scavenged(
                        scavenge_id,
                        start,
                        end,
                        started.elapsed(),
                        "Chunks could not be merged",
                    )
                    .await?;
                Ok(false)
            }
            Err(e) => {
                warn!(start, end, error = %e, "Failed to merge chunks");
                self.log
                    .chunks_not_scavenged(scavenge_id, start, end, started.elapsed(), e.to_string())
                    .await?;
                Ok(false)
            }
        }
    }

    async fn write_merged(&self, group: &[Arc<Chunk>]) -> Result<Option<i64>, StorageError> {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            return Ok(None);
        };
        let manager = self.db.manager();
        let temp = manager
            .create_temp_chunk(first.start_number(), last.end_number())
            .await?;

        for chunk in group {
            for record in chunk.read_all_records().await? {
                if let ChunkAppend::NoRoom { .. } = temp.append(&record).await? {
                    temp.mark_for_deletion();
                    return Ok(None);
                }
            }
        }
        let logical = last.start_position() - first.start_position() + last.logical_data_size();
        temp.complete_scavenged(logical).await?;

        let old_size: i64 = group.iter().map(|c| c.file_size() as i64).sum();
        let new_size = temp.file_size() as i64;
        Ok(manager
            .switch_chunk(temp, self.db.config().verify_hashes)
            .await?
            .map(|_| old_size - new_size))
    }
}
