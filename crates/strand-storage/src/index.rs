//! In-memory stream index
//!
//! Tracks, per stream, the last event number, whether the stream is
//! deleted, its retention metadata and the log position of every event
//! number. It is rebuilt from the log on startup and fed every committed
//! record afterwards. The scavenger consults it through [`ScavengeIndex`].

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use parking_lot::Mutex;
use strand_core::{
    LogRecord, METADATA_EVENT_TYPE, NO_STREAM, PrepareRecord, StreamMetadata, is_metastream,
    original_stream_of,
};
use tracing::warn;

/// Last event number reported for a deleted stream
pub const DELETED_STREAM: i64 = i64::MAX;

/// Index queries needed to decide which records a scavenge may drop
pub trait ScavengeIndex: Send + Sync {
    /// Last event number, [`NO_STREAM`] if absent, [`DELETED_STREAM`] if deleted
    fn last_event_number(&self, stream: &str) -> i64;

    /// Retention rules in effect for the stream
    fn stream_metadata(&self, stream: &str) -> StreamMetadata;

    /// Position of the event the index holds for `stream`/`event_number`
    fn event_position(&self, stream: &str, event_number: i64) -> Option<i64>;

    fn is_stream_deleted(&self, stream: &str) -> bool {
        self.last_event_number(stream) == DELETED_STREAM
    }
}

#[derive(Debug, Default)]
struct StreamEntry {
    last_event_number: Option<i64>,
    deleted: bool,
    metadata: Option<StreamMetadata>,
    positions: BTreeMap<i64, i64>,
}

/// Default [`ScavengeIndex`] implementation
#[derive(Debug, Default)]
pub struct StreamIndex {
    streams: DashMap<String, StreamEntry>,
    /// Prepares waiting for their commit, keyed by transaction position
    pending: Mutex<HashMap<i64, Vec<PrepareRecord>>>,
}

impl StreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one record in log order
    pub fn apply(&self, record: &LogRecord) {
        match record {
            LogRecord::Prepare(prepare) if prepare.is_committed() => {
                self.index_event(prepare, prepare.expected_version + 1);
            }
            LogRecord::Prepare(prepare) => {
                self.pending
                    .lock()
                    .entry(prepare.transaction_position)
                    .or_default()
                    .push(prepare.clone());
            }
            LogRecord::Commit(commit) => {
                let prepares = self
                    .pending
                    .lock()
                    .remove(&commit.transaction_position)
                    .unwrap_or_default();
                for prepare in prepares {
                    if prepare.has_data() || prepare.is_tombstone() {
                        let number = commit.first_event_number + prepare.transaction_offset as i64;
                        self.index_event(&prepare, number);
                    }
                }
            }
            LogRecord::System(_) => {}
        }
    }

    fn index_event(&self, prepare: &PrepareRecord, event_number: i64) {
        let mut entry = self.streams.entry(prepare.stream_id.clone()).or_default();
        if prepare.is_tombstone() {
            entry.deleted = true;
            entry.positions.entry(event_number).or_insert(prepare.log_position);
            return;
        }
        if !prepare.has_data() {
            return;
        }
        // First write of an event number wins; later ones are duplicates
        entry
            .positions
            .entry(event_number)
            .or_insert(prepare.log_position);
        if entry.last_event_number.is_none_or(|last| event_number > last) {
            entry.last_event_number = Some(event_number);
        }
        drop(entry);

        if prepare.event_type == METADATA_EVENT_TYPE {
            if let Some(original) = original_stream_of(&prepare.stream_id) {
                match StreamMetadata::from_json(&prepare.data) {
                    Ok(metadata) => {
                        self.streams
                            .entry(original.to_string())
                            .or_default()
                            .metadata = Some(metadata);
                    }
                    Err(e) => {
                        warn!(stream = original, error = %e, "Ignoring malformed stream metadata");
                    }
                }
            }
        }
    }

    /// Number of streams seen
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Transactions still waiting for a commit
    pub fn pending_transactions(&self) -> usize {
        self.pending.lock().len()
    }
}

impl ScavengeIndex for StreamIndex {
    fn last_event_number(&self, stream: &str) -> i64 {
        match self.streams.get(stream) {
            Some(entry) if entry.deleted => DELETED_STREAM,
            Some(entry) => entry.last_event_number.unwrap_or(NO_STREAM),
            None => NO_STREAM,
        }
    }

    fn stream_metadata(&self, stream: &str) -> StreamMetadata {
        if is_metastream(stream) {
            return StreamMetadata::for_metastream();
        }
        self.streams
            .get(stream)
            .and_then(|entry| entry.metadata.clone())
            .unwrap_or_default()
    }

    fn event_position(&self, stream: &str, event_number: i64) -> Option<i64> {
        self.streams
            .get(stream)
            .and_then(|entry| entry.positions.get(&event_number).copied())
    }
}
