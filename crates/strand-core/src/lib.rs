//! # Strand Core
//!
//! Core types shared by every layer of the Strand transaction log.
//!
//! This crate has no I/O. It defines what a log record is, how record bodies
//! are encoded, how stream metadata is expressed and which sentinel values the
//! rest of the stack agrees on.
//!
//! ## Key Types
//!
//! - [`LogRecord`]: Tagged union of [`PrepareRecord`], [`CommitRecord`] and [`SystemRecord`]
//! - [`PrepareFlags`]: Transaction boundary, tombstone and implicit-commit markers
//! - [`StreamMetadata`]: Per-stream retention rules consulted by the scavenger
//! - [`ExpectedVersion`]: Optimistic concurrency guard for stream writes

pub mod error;
pub mod metadata;
pub mod position;
pub mod record;

pub use error::CoreError;
pub use metadata::{METADATA_EVENT_TYPE, StreamMetadata, is_metastream, metastream_of, original_stream_of};
pub use position::{ExpectedVersion, LogPosition, NO_STREAM, UNSET_POSITION};
pub use record::{
    CommitRecord, EpochRecord, LogRecord, PrepareFlags, PrepareRecord, RecordKind, SystemPayload,
    SystemRecord,
};
