//! Log positions, event numbers and their sentinels

use serde::{Deserialize, Serialize};

/// A byte offset in the logical transaction log
pub type LogPosition = i64;

/// Sentinel for a position that has not been set yet
pub const UNSET_POSITION: LogPosition = -1;

/// Last event number of a stream that has no events
pub const NO_STREAM: i64 = -1;

/// Optimistic concurrency expectation for a stream write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Write regardless of the current stream version
    Any,
    /// The stream must not exist yet
    NoStream,
    /// The stream's last event number must equal this value
    Exact(i64),
}

impl ExpectedVersion {
    /// Check the expectation against the current last event number
    pub fn matches(self, current: i64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current == NO_STREAM,
            ExpectedVersion::Exact(v) => v == current,
        }
    }

    /// Raw value stored in a prepare record
    pub fn as_raw(self) -> i64 {
        match self {
            ExpectedVersion::Any => -2,
            ExpectedVersion::NoStream => NO_STREAM,
            ExpectedVersion::Exact(v) => v,
        }
    }
}
