//! Stream metadata
//!
//! Metadata for stream `s` is written as a `$metadata` event to the
//! metastream `$$s`. The latest version wins; older versions are superseded
//! and become eligible for scavenging.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Event type used for metadata events in a metastream
pub const METADATA_EVENT_TYPE: &str = "$metadata";

const METASTREAM_PREFIX: &str = "$$";

/// Retention rules for a single stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Keep at most this many of the most recent events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,
    /// Drop events older than this many milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_ms: Option<i64>,
    /// Drop events with a lower event number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<i64>,
}

impl StreamMetadata {
    /// Metadata with a max-count rule
    pub fn with_max_count(mut self, max_count: i64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Metadata with a max-age rule
    pub fn with_max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self
    }

    /// Metadata with a truncate-before rule
    pub fn with_truncate_before(mut self, event_number: i64) -> Self {
        self.truncate_before = Some(event_number);
        self
    }

    /// Metadata implicitly applied to every metastream
    pub fn for_metastream() -> Self {
        Self::default().with_max_count(1)
    }

    /// Whether any retention rule is set
    pub fn is_empty(&self) -> bool {
        self.max_count.is_none() && self.max_age_ms.is_none() && self.truncate_before.is_none()
    }

    /// Serialize to the JSON body of a `$metadata` event
    pub fn to_json(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(CoreError::from)
    }

    /// Parse the JSON body of a `$metadata` event
    pub fn from_json(data: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(data).map_err(CoreError::from)
    }
}

/// Name of the metastream that holds metadata for `stream`
pub fn metastream_of(stream: &str) -> String {
    format!("{METASTREAM_PREFIX}{stream}")
}

/// Whether `stream` is a metastream
pub fn is_metastream(stream: &str) -> bool {
    stream.starts_with(METASTREAM_PREFIX)
}

/// The stream a metastream describes, or `None` for a regular stream
pub fn original_stream_of(stream: &str) -> Option<&str> {
    stream.strip_prefix(METASTREAM_PREFIX)
}
