//! Durable position checkpoints
//!
//! Each checkpoint is a single 64-bit little-endian position in its own
//! file. Writes update the in-memory value only; [`Checkpoint::flush`]
//! makes it durable and publishes it to subscribers.
//!
//! | checkpoint  | meaning                                   |
//! |-------------|-------------------------------------------|
//! | writer      | end of data written to chunk files        |
//! | chaser      | end of data durably flushed and readable  |
//! | epoch       | position of the latest epoch record       |
//! | truncate    | pending truncation target, `-1` if none   |
//! | replication | highest position acknowledged by a quorum |

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use strand_core::UNSET_POSITION;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, watch};
use tracing::{debug, trace};

use crate::error::StorageError;

/// The checkpoints kept by a chunk database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    Writer,
    Chaser,
    Epoch,
    Truncate,
    Replication,
}

impl CheckpointKind {
    pub const ALL: [CheckpointKind; 5] = [
        CheckpointKind::Writer,
        CheckpointKind::Chaser,
        CheckpointKind::Epoch,
        CheckpointKind::Truncate,
        CheckpointKind::Replication,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CheckpointKind::Writer => "writer",
            CheckpointKind::Chaser => "chaser",
            CheckpointKind::Epoch => "epoch",
            CheckpointKind::Truncate => "truncate",
            CheckpointKind::Replication => "replication",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.chk", self.name())
    }

    /// Value of a checkpoint that has never been written
    pub fn initial_value(self) -> i64 {
        match self {
            CheckpointKind::Writer | CheckpointKind::Chaser => 0,
            _ => UNSET_POSITION,
        }
    }

    /// Whether the checkpoint may hold `-1`
    pub fn allows_unset(self) -> bool {
        !matches!(self, CheckpointKind::Writer | CheckpointKind::Chaser)
    }
}

enum Backend {
    Memory,
    File(Mutex<File>),
}

/// A single monotonic checkpoint
pub struct Checkpoint {
    kind: CheckpointKind,
    value: AtomicI64,
    flushed: watch::Sender<i64>,
    backend: Backend,
}

impl Checkpoint {
    /// Open or create the checkpoint file in `dir`
    pub async fn open(dir: impl AsRef<Path>, kind: CheckpointKind) -> Result<Self, StorageError> {
        let path = dir.as_ref().join(kind.file_name());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let len = file.metadata().await?.len();
        let value = if len >= 8 {
            let mut buf = [0u8; 8];
            file.read_exact(&mut buf).await?;
            i64::from_le_bytes(buf)
        } else {
            let initial = kind.initial_value();
            file.set_len(0).await?;
            file.write_all(&initial.to_le_bytes()).await?;
            file.sync_all().await?;
            initial
        };

        debug!(checkpoint = kind.name(), value, "Opened checkpoint");
        Ok(Self::with_backend(kind, value, Backend::File(Mutex::new(file))))
    }

    /// Checkpoint that is never persisted
    pub fn in_memory(kind: CheckpointKind, value: i64) -> Self {
        Self::with_backend(kind, value, Backend::Memory)
    }

    fn with_backend(kind: CheckpointKind, value: i64, backend: Backend) -> Self {
        let (flushed, _) = watch::channel(value);
        Self {
            kind,
            value: AtomicI64::new(value),
            flushed,
            backend,
        }
    }

    pub fn kind(&self) -> CheckpointKind {
        self.kind
    }

    /// Current in-memory value
    pub fn read(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Last flushed value
    pub fn read_flushed(&self) -> i64 {
        *self.flushed.borrow()
    }

    /// Advance the checkpoint
    ///
    /// Moving backwards is rejected. Checkpoints that allow it may be reset
    /// to `-1`.
    pub fn write(&self, position: i64) -> Result<(), StorageError> {
        if position == UNSET_POSITION && self.kind.allows_unset() {
            self.value.store(position, Ordering::Release);
            return Ok(());
        }
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (position >= current).then_some(position)
            })
            .map(|_| ())
            .map_err(|current| StorageError::CheckpointRegression {
                name: self.kind.name(),
                current,
                attempted: position,
            })
    }

    /// Overwrite without the monotonic check, for truncation only
    pub(crate) fn reset(&self, position: i64) {
        self.value.store(position, Ordering::Release);
    }

    /// Persist the current value and notify subscribers
    pub async fn flush(&self) -> Result<(), StorageError> {
        let value = self.read();
        if let Backend::File(file) = &self.backend {
            let mut file = file.lock().await;
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(&value.to_le_bytes()).await?;
            file.flush().await?;
            file.sync_data().await?;
        }
        trace!(checkpoint = self.kind.name(), value, "Flushed checkpoint");
        self.flushed.send_replace(value);
        Ok(())
    }

    /// Observe flushed values
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.flushed.subscribe()
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("kind", &self.kind)
            .field("value", &self.read())
            .field("flushed", &self.read_flushed())
            .finish()
    }
}

/// The five checkpoints of a database
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pub writer: Arc<Checkpoint>,
    pub chaser: Arc<Checkpoint>,
    pub epoch: Arc<Checkpoint>,
    pub truncate: Arc<Checkpoint>,
    pub replication: Arc<Checkpoint>,
}

impl CheckpointStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        Ok(Self {
            writer: Arc::new(Checkpoint::open(dir, CheckpointKind::Writer).await?),
            chaser: Arc::new(Checkpoint::open(dir, CheckpointKind::Chaser).await?),
            epoch: Arc::new(Checkpoint::open(dir, CheckpointKind::Epoch).await?),
            truncate: Arc::new(Checkpoint::open(dir, CheckpointKind::Truncate).await?),
            replication: Arc::new(Checkpoint::open(dir, CheckpointKind::Replication).await?),
        })
    }

    pub fn in_memory() -> Self {
        let make = |kind: CheckpointKind| Arc::new(Checkpoint::in_memory(kind, kind.initial_value()));
        Self {
            writer: make(CheckpointKind::Writer),
            chaser: make(CheckpointKind::Chaser),
            epoch: make(CheckpointKind::Epoch),
            truncate: make(CheckpointKind::Truncate),
            replication: make(CheckpointKind::Replication),
        }
    }

    pub fn get(&self, kind: CheckpointKind) -> &Arc<Checkpoint> {
        match kind {
            CheckpointKind::Writer => &self.writer,
            CheckpointKind::Chaser => &self.chaser,
            CheckpointKind::Epoch => &self.epoch,
            CheckpointKind::Truncate => &self.truncate,
            CheckpointKind::Replication => &self.replication,
        }
    }

    pub async fn flush_all(&self) -> Result<(), StorageError> {
        for kind in CheckpointKind::ALL {
            self.get(kind).flush().await?;
        }
        Ok(())
    }
}
