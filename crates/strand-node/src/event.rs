//! Client-facing write types

use bytes::Bytes;
use strand_core::{PrepareFlags, PrepareRecord};
use uuid::Uuid;

/// An event to be written to a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
    pub is_json: bool,
}

impl NewEvent {
    /// Event with a binary body
    pub fn new(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Bytes::new(),
            is_json: false,
        }
    }

    /// Event with a JSON body
    pub fn json(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            is_json: true,
            ..Self::new(event_type, data)
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    /// The prepare for event `offset` of a write of `count` events
    pub(crate) fn into_prepare(
        self,
        stream: &str,
        expected_version: i64,
        offset: usize,
        count: usize,
    ) -> PrepareRecord {
        let mut flags = PrepareFlags::DATA | PrepareFlags::IS_COMMITTED;
        if offset == 0 {
            flags |= PrepareFlags::TRANSACTION_BEGIN;
        }
        if offset + 1 == count {
            flags |= PrepareFlags::TRANSACTION_END;
        }
        if self.is_json {
            flags |= PrepareFlags::IS_JSON;
        }

        let mut prepare = PrepareRecord::new(stream, expected_version, self.event_type, self.data)
            .with_flags(flags)
            .with_transaction_offset(offset as i32)
            .with_metadata(self.metadata);
        prepare.event_id = self.event_id;
        prepare
    }
}

/// Outcome of a stream write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// Event number of the first written event
    pub first_event_number: i64,
    /// Event number of the last written event, the stream's new version
    pub last_event_number: i64,
    /// Log position of each written event
    pub positions: Vec<i64>,
    /// Writer position after the write; commit waits use this
    pub end_position: i64,
}
