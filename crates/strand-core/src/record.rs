//! Log records
//!
//! Every entry in the transaction log is a [`LogRecord`]. Records are
//! immutable once written and their log position is never reused. The
//! body of a record is postcard-encoded; framing and transforms are the
//! storage layer's concern.

use std::ops::{BitOr, BitOrAssign};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::position::{LogPosition, UNSET_POSITION};

/// Flags carried by a prepare record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PrepareFlags(u16);

impl PrepareFlags {
    pub const NONE: Self = Self(0);
    /// The prepare carries event data
    pub const DATA: Self = Self(0x0001);
    /// First prepare of a transaction
    pub const TRANSACTION_BEGIN: Self = Self(0x0002);
    /// Last prepare of a transaction
    pub const TRANSACTION_END: Self = Self(0x0004);
    /// Tombstone: the stream is deleted
    pub const STREAM_DELETE: Self = Self(0x0008);
    /// Committed by itself, no commit record follows
    pub const IS_COMMITTED: Self = Self(0x0020);
    /// Data is JSON
    pub const IS_JSON: Self = Self(0x0100);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// All bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for PrepareFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PrepareFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Discriminant of a [`LogRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Prepare,
    Commit,
    System,
}

/// Pending (or implicitly committed) write of a single event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRecord {
    pub log_position: LogPosition,
    /// Position of the first prepare of the transaction
    pub transaction_position: LogPosition,
    /// Offset of this prepare within its transaction
    pub transaction_offset: i32,
    pub flags: PrepareFlags,
    pub stream_id: String,
    /// Last event number the writer expected, see [`crate::ExpectedVersion::as_raw`]
    pub expected_version: i64,
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub timestamp_millis: i64,
    pub event_type: String,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl PrepareRecord {
    /// Create an implicitly committed data prepare with positions left unset
    pub fn new(
        stream_id: impl Into<String>,
        expected_version: i64,
        event_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            log_position: UNSET_POSITION,
            transaction_position: UNSET_POSITION,
            transaction_offset: 0,
            flags: PrepareFlags::DATA
                | PrepareFlags::IS_COMMITTED
                | PrepareFlags::TRANSACTION_BEGIN
                | PrepareFlags::TRANSACTION_END,
            stream_id: stream_id.into(),
            expected_version,
            event_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            event_type: event_type.into(),
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    /// Create the tombstone that marks `stream_id` deleted
    pub fn tombstone(stream_id: impl Into<String>, expected_version: i64) -> Self {
        let mut prepare = Self::new(stream_id, expected_version, "$streamDeleted", Bytes::new());
        prepare.flags = PrepareFlags::STREAM_DELETE
            | PrepareFlags::IS_COMMITTED
            | PrepareFlags::TRANSACTION_BEGIN
            | PrepareFlags::TRANSACTION_END;
        prepare
    }

    /// Replace the flags
    pub fn with_flags(mut self, flags: PrepareFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the transaction offset
    pub fn with_transaction_offset(mut self, offset: i32) -> Self {
        self.transaction_offset = offset;
        self
    }

    /// Override the timestamp
    pub fn with_timestamp_millis(mut self, timestamp_millis: i64) -> Self {
        self.timestamp_millis = timestamp_millis;
        self
    }

    /// Set the event metadata
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.flags.contains(PrepareFlags::STREAM_DELETE)
    }

    pub fn is_committed(&self) -> bool {
        self.flags.contains(PrepareFlags::IS_COMMITTED)
    }

    pub fn has_data(&self) -> bool {
        self.flags.contains(PrepareFlags::DATA)
    }
}

/// Finalizes the prepares of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub log_position: LogPosition,
    pub transaction_position: LogPosition,
    /// Event number assigned to the prepare at transaction offset zero
    pub first_event_number: i64,
    pub timestamp_millis: i64,
    pub correlation_id: Uuid,
}

impl CommitRecord {
    pub fn new(transaction_position: LogPosition, first_event_number: i64) -> Self {
        Self {
            log_position: UNSET_POSITION,
            transaction_position,
            first_event_number,
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            correlation_id: Uuid::new_v4(),
        }
    }
}

/// Marker written when a node takes leadership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch_number: i64,
    pub epoch_id: Uuid,
    pub prev_epoch_position: LogPosition,
    pub leader_instance_id: Uuid,
}

/// Payload of a system record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemPayload {
    Epoch(EpochRecord),
}

/// Record written by the node itself rather than by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub log_position: LogPosition,
    pub timestamp_millis: i64,
    pub payload: SystemPayload,
}

impl SystemRecord {
    pub fn epoch(epoch: EpochRecord) -> Self {
        Self {
            log_position: UNSET_POSITION,
            timestamp_millis: chrono::Utc::now().timestamp_millis(),
            payload: SystemPayload::Epoch(epoch),
        }
    }
}

/// A single entry of the transaction log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Prepare(PrepareRecord),
    Commit(CommitRecord),
    System(SystemRecord),
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Prepare(_) => RecordKind::Prepare,
            LogRecord::Commit(_) => RecordKind::Commit,
            LogRecord::System(_) => RecordKind::System,
        }
    }

    /// Global position of the record
    pub fn position(&self) -> LogPosition {
        match self {
            LogRecord::Prepare(p) => p.log_position,
            LogRecord::Commit(c) => c.log_position,
            LogRecord::System(s) => s.log_position,
        }
    }

    /// Stamp the global position. Used by the writer only.
    pub fn set_position(&mut self, position: LogPosition) {
        match self {
            LogRecord::Prepare(p) => p.log_position = position,
            LogRecord::Commit(c) => c.log_position = position,
            LogRecord::System(s) => s.log_position = position,
        }
    }

    /// Transaction this record belongs to, if any
    pub fn transaction_position(&self) -> Option<LogPosition> {
        match self {
            LogRecord::Prepare(p) => Some(p.transaction_position),
            LogRecord::Commit(c) => Some(c.transaction_position),
            LogRecord::System(_) => None,
        }
    }

    /// Overwrite the transaction position. Used by the writer only.
    pub fn set_transaction_position(&mut self, position: LogPosition) {
        match self {
            LogRecord::Prepare(p) => p.transaction_position = position,
            LogRecord::Commit(c) => c.transaction_position = position,
            LogRecord::System(_) => {}
        }
    }

    /// Fill an unset transaction position
    pub fn set_transaction_position_if_unset(&mut self, position: LogPosition) {
        match self {
            LogRecord::Prepare(p) if p.transaction_position == UNSET_POSITION => {
                p.transaction_position = position
            }
            LogRecord::Commit(c) if c.transaction_position == UNSET_POSITION => {
                c.transaction_position = position
            }
            _ => {}
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        match self {
            LogRecord::Prepare(p) => p.timestamp_millis,
            LogRecord::Commit(c) => c.timestamp_millis,
            LogRecord::System(s) => s.timestamp_millis,
        }
    }

    pub fn as_prepare(&self) -> Option<&PrepareRecord> {
        match self {
            LogRecord::Prepare(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_commit(&self) -> Option<&CommitRecord> {
        match self {
            LogRecord::Commit(c) => Some(c),
            _ => None,
        }
    }

    /// Encode the record body
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        postcard::to_allocvec(self).map_err(|e| CoreError::Encode(e.to_string()))
    }

    /// Decode a record body produced by [`LogRecord::encode`]
    pub fn decode(body: &[u8]) -> Result<Self, CoreError> {
        postcard::from_bytes(body).map_err(CoreError::from)
    }
}

impl From<PrepareRecord> for LogRecord {
    fn from(record: PrepareRecord) -> Self {
        LogRecord::Prepare(record)
    }
}

impl From<CommitRecord> for LogRecord {
    fn from(record: CommitRecord) -> Self {
        LogRecord::Commit(record)
    }
}

impl From<SystemRecord> for LogRecord {
    fn from(record: SystemRecord) -> Self {
        LogRecord::System(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN;
        assert!(flags.contains(PrepareFlags::DATA));
        assert!(!flags.contains(PrepareFlags::DATA | PrepareFlags::STREAM_DELETE));
        assert!(flags.intersects(PrepareFlags::DATA | PrepareFlags::STREAM_DELETE));
        assert_eq!(PrepareFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_prepare_encode_decode() {
        let mut record = LogRecord::from(
            PrepareRecord::new("orders", 4, "OrderPlaced", &b"{\"id\":1}"[..])
                .with_metadata(&b"meta"[..]),
        );
        record.set_position(4096);
        record.set_transaction_position_if_unset(4096);

        let body = record.encode().unwrap();
        let decoded = LogRecord::decode(&body).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.position(), 4096);
        assert_eq!(decoded.transaction_position(), Some(4096));
    }

    #[test]
    fn test_transaction_position_only_filled_once() {
        let mut record = LogRecord::from(CommitRecord::new(100, 0));
        record.set_transaction_position_if_unset(500);
        assert_eq!(record.transaction_position(), Some(100));
    }

    #[test]
    fn test_tombstone_flags() {
        let tombstone = PrepareRecord::tombstone("orders", 3);
        assert!(tombstone.is_tombstone());
        assert!(tombstone.is_committed());
        assert!(!tombstone.has_data());
    }

    #[test]
    fn test_system_record_kind() {
        let record = LogRecord::from(SystemRecord::epoch(EpochRecord {
            epoch_number: 1,
            epoch_id: Uuid::new_v4(),
            prev_epoch_position: UNSET_POSITION,
            leader_instance_id: Uuid::new_v4(),
        }));
        assert_eq!(record.kind(), RecordKind::System);
        assert_eq!(record.transaction_position(), None);
        assert!(record.as_prepare().is_none());
    }

    #[test]
    fn test_truncated_body_fails() {
        let record = LogRecord::from(PrepareRecord::new("s", -1, "e", &b"x"[..]));
        let body = record.encode().unwrap();
        tokio_test::assert_err!(LogRecord::decode(&body[..body.len() / 2]));
    }
}
