//! Chunk database
//!
//! Ties chunks and checkpoints together: validates and recovers the chain
//! on open, appends records with rollover, and serves reads bounded by the
//! chaser checkpoint so unflushed bytes are never visible.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use strand_core::{LogRecord, UNSET_POSITION};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::chunk::transform::{ChunkTransform, TransformKind};
use crate::chunk::{Chunk, ChunkAppend, display_name, encode_frame};
use crate::config::DbConfig;
use crate::error::StorageError;
use crate::manager::ChunkManager;

/// Result of a successful append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    /// Position of each record, in input order
    pub positions: Vec<i64>,
    /// Writer position after the last record
    pub end_position: i64,
}

struct WriterState {
    chunk: Arc<Chunk>,
}

/// A chunked transaction log on disk
pub struct ChunkDb {
    config: DbConfig,
    checkpoints: CheckpointStore,
    manager: Arc<ChunkManager>,
    writer: Mutex<Option<WriterState>>,
}

impl ChunkDb {
    /// Open the database, recovering from any crash
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub async fn open(config: DbConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path).await?;
        let checkpoints = if config.in_memory_checkpoints {
            CheckpointStore::in_memory()
        } else {
            CheckpointStore::open(&config.path).await?
        };
        let manager = Arc::new(ChunkManager::new(&config));

        let db = Self {
            config,
            checkpoints,
            manager,
            writer: Mutex::new(None),
        };
        db.apply_pending_truncation().await?;
        db.delete_temp_files().await?;
        let chunk = db.load_chain().await?;
        *db.writer.lock().await = Some(WriterState { chunk });

        info!(
            writer = db.checkpoints.writer.read(),
            chunks = db.manager.chunk_count(),
            "Opened chunk database"
        );
        Ok(db)
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn manager(&self) -> &Arc<ChunkManager> {
        &self.manager
    }

    pub fn chunk_size(&self) -> i64 {
        self.config.chunk_size as i64
    }

    /// Position below which reads are served
    pub fn readable_position(&self) -> i64 {
        self.checkpoints.chaser.read()
    }

    async fn apply_pending_truncation(&self) -> Result<(), StorageError> {
        let target = self.checkpoints.truncate.read();
        if target == UNSET_POSITION {
            return Ok(());
        }
        let writer = self.checkpoints.writer.read();
        if target >= writer {
            info!(target, writer, "Truncation target not behind writer, clearing");
            self.checkpoints.truncate.write(UNSET_POSITION)?;
            self.checkpoints.truncate.flush().await?;
            return Ok(());
        }

        let chunk_size = self.chunk_size();
        let naming = self.manager.naming();
        let target_number = (target / chunk_size) as i32;
        let mut new_writer = target;

        for file in naming.list_chunks().await? {
            let (header, completed) = Chunk::probe(&file.path).await?;
            let covers_target = header.chunk_start_number <= target_number
                && header.chunk_end_number >= target_number;
            let beyond = header.chunk_start_number > target_number;
            if covers_target && completed {
                // Completed chunks are immutable; restart from its start
                new_writer = new_writer.min(header.chunk_start_position());
                tokio::fs::remove_file(&file.path).await?;
                info!(file = %display_name(&file.path), "Deleted completed chunk during truncation");
            } else if beyond {
                tokio::fs::remove_file(&file.path).await?;
                info!(file = %display_name(&file.path), "Deleted chunk beyond truncation point");
            }
        }

        // A completed chunk deleted above may have covered earlier numbers
        let new_writer_number = (new_writer / chunk_size) as i32;
        for file in naming.list_chunks().await? {
            if file.start_number > new_writer_number {
                tokio::fs::remove_file(&file.path).await?;
            }
        }

        let cp = &self.checkpoints;
        cp.writer.reset(new_writer);
        cp.chaser.reset(cp.chaser.read().min(new_writer));
        if cp.epoch.read() >= new_writer {
            cp.epoch.reset(UNSET_POSITION);
        }
        if cp.replication.read() > new_writer {
            cp.replication.reset(new_writer);
        }
        cp.truncate.reset(UNSET_POSITION);
        cp.flush_all().await?;

        warn!(target, writer, new_writer, "Truncated transaction log");
        Ok(())
    }

    async fn delete_temp_files(&self) -> Result<(), StorageError> {
        for path in self.manager.naming().list_temp_files().await? {
            tokio::fs::remove_file(&path).await?;
            info!(file = %display_name(&path), "Deleted leftover scavenge temp file");
        }
        Ok(())
    }

    /// Open every chunk up to the writer checkpoint and return the one to
    /// append to
    async fn load_chain(&self) -> Result<Arc<Chunk>, StorageError> {
        let chunk_size = self.chunk_size();
        let naming = self.manager.naming().clone();
        let transform = self.manager.transform_config().await;
        let max_readers = self.manager.max_readers();
        let mut writer_pos = self.checkpoints.writer.read();
        let mut last_number = (writer_pos / chunk_size) as i32;

        let files = naming.list_chunks().await?;
        let mut expected = 0i32;
        let mut writable: Option<Arc<Chunk>> = None;

        while expected <= last_number {
            let versions: Vec<_> = files.iter().filter(|f| f.start_number == expected).collect();
            let Some(latest) = versions.first() else {
                if expected == last_number && writer_pos == expected as i64 * chunk_size {
                    break;
                }
                error!(missing = expected, writer = writer_pos, "Chunk chain has a gap");
                return Err(StorageError::ChainGap { missing: expected });
            };
            for stale in &versions[1..] {
                tokio::fs::remove_file(&stale.path).await?;
                info!(file = %display_name(&stale.path), "Deleted superseded chunk version");
            }

            let (header, completed) = Chunk::probe(&latest.path).await.inspect_err(|e| {
                error!(file = %display_name(&latest.path), error = %e, "Unreadable chunk header");
            })?;
            if header.chunk_start_number != expected || header.chunk_size != self.config.chunk_size {
                error!(
                    file = %display_name(&latest.path),
                    start = header.chunk_start_number,
                    chunk_size = header.chunk_size,
                    "Chunk header does not match its position in the chain"
                );
                return Err(StorageError::corrupt(
                    display_name(&latest.path),
                    "header does not match chain position",
                ));
            }

            if completed {
                let chunk = Chunk::open_completed(
                    &latest.path,
                    &transform,
                    self.config.verify_hashes,
                    max_readers,
                )
                .await
                .inspect_err(|e| {
                    error!(file = %display_name(&latest.path), error = %e, "Completed chunk failed validation");
                })?;
                let chunk = Arc::new(chunk);
                self.manager.add_chunk(Arc::clone(&chunk))?;

                if chunk.end_number() >= last_number {
                    // Footer is authoritative for where the chunk ends
                    writer_pos = chunk.end_position();
                    last_number = chunk.end_number() + 1;
                    self.checkpoints.writer.reset(writer_pos);
                    self.checkpoints.writer.flush().await?;
                    debug!(writer = writer_pos, "Advanced writer past completed chunk");
                }
                expected = chunk.end_number() + 1;
            } else {
                if expected != last_number {
                    error!(
                        file = %display_name(&latest.path),
                        writer = writer_pos,
                        "Incomplete chunk found before the writer's chunk"
                    );
                    return Err(StorageError::corrupt(
                        display_name(&latest.path),
                        "chunk is not completed but is not the last chunk",
                    ));
                }
                let chunk = Chunk::open_ongoing(
                    &latest.path,
                    writer_pos - header.chunk_start_position(),
                    &transform,
                    max_readers,
                )
                .await?;
                let chunk = Arc::new(chunk);
                self.manager.add_chunk(Arc::clone(&chunk))?;
                if chunk.discarded_ciphertext() {
                    // Never encrypt new data over positions already used
                    chunk.complete().await?;
                    writer_pos = chunk.end_position();
                    last_number = chunk.end_number() + 1;
                    self.checkpoints.writer.reset(writer_pos);
                    self.checkpoints.writer.flush().await?;
                    warn!(
                        chunk = chunk.start_number(),
                        writer = writer_pos,
                        "Completed encrypted chunk early after dropping its unflushed tail"
                    );
                } else {
                    writable = Some(chunk);
                }
                expected += 1;
            }
        }

        let loaded: HashSet<PathBuf> = self
            .manager
            .chunks()
            .iter()
            .map(|c| c.path().to_path_buf())
            .collect();
        for file in &files {
            if !loaded.contains(&file.path) && tokio::fs::try_exists(&file.path).await? {
                tokio::fs::remove_file(&file.path).await?;
                info!(file = %display_name(&file.path), "Deleted chunk outside the live chain");
            }
        }

        let writable = match writable {
            Some(chunk) => chunk,
            None => self.manager.add_new_chunk(last_number).await?,
        };

        if self.checkpoints.chaser.read() != writer_pos {
            self.checkpoints.chaser.reset(writer_pos);
            self.checkpoints.chaser.flush().await?;
        }
        Ok(writable)
    }

    /// Append records as one batch
    ///
    /// Positions are stamped here. Records without a transaction position
    /// get the position of the first record in the batch. A record that
    /// does not fit completes the current chunk and continues in a new one.
    ///
    /// The batch is laid out before anything is written, so a record that
    /// can never fit rejects the whole batch. If a write still fails part
    /// way, the frames already written to the current chunk are rewound.
    pub async fn append(&self, records: Vec<LogRecord>) -> Result<AppendResult, StorageError> {
        let mut guard = self.writer.lock().await;
        let state = guard.as_mut().ok_or(StorageError::Closed)?;
        self.plan_batch(&state.chunk, &records).await?;

        let batch_chunk = Arc::clone(&state.chunk);
        let batch_start = batch_chunk.physical_data_size();
        let writer_before = self.checkpoints.writer.read();
        match self.write_batch(state, records).await {
            Ok(result) => Ok(result),
            Err(err) => {
                error!(error = %err, "Batch append failed");
                let undone = self
                    .undo_batch(state, &batch_chunk, batch_start, writer_before)
                    .await;
                if let Err(undo) = undone {
                    error!(error = %undo, "Could not undo partial batch, closing the writer");
                    *guard = None;
                }
                Err(err)
            }
        }
    }

    /// Stamp a copy of the batch against the current chunk and the chunks
    /// that would follow it, failing on any record that fits in none
    async fn plan_batch(&self, chunk: &Chunk, records: &[LogRecord]) -> Result<(), StorageError> {
        let mut transform = chunk.transform().clone();
        let mut start = chunk.start_position();
        let mut capacity = chunk.header().data_capacity();
        let mut cursor = chunk.physical_data_size();
        let mut first_position: Option<i64> = None;

        for record in records {
            let mut record = record.clone();
            let fill_transaction = record.transaction_position() == Some(UNSET_POSITION);
            loop {
                let position = start + cursor;
                record.set_position(position);
                if fill_transaction {
                    record.set_transaction_position(first_position.unwrap_or(position));
                }
                let frame_len = encode_frame(&transform, &record, cursor)?.len();
                if cursor + frame_len as i64 <= capacity {
                    first_position.get_or_insert(position);
                    cursor += frame_len as i64;
                    break;
                }
                if cursor == 0 {
                    return Err(StorageError::RecordTooLarge {
                        size: frame_len,
                        capacity,
                    });
                }
                start += capacity;
                capacity = self.chunk_size();
                cursor = 0;
                transform = ChunkTransform::for_new_chunk(&self.manager.transform_config().await)?;
            }
        }
        Ok(())
    }

    async fn write_batch(
        &self,
        state: &mut WriterState,
        records: Vec<LogRecord>,
    ) -> Result<AppendResult, StorageError> {
        let mut positions = Vec::with_capacity(records.len());
        let mut first_position: Option<i64> = None;

        for mut record in records {
            let fill_transaction = record.transaction_position() == Some(UNSET_POSITION);
            loop {
                let chunk = Arc::clone(&state.chunk);
                let position = chunk.next_log_position();
                record.set_position(position);
                if fill_transaction {
                    record.set_transaction_position(first_position.unwrap_or(position));
                }

                match chunk.append(&record).await? {
                    ChunkAppend::Written { .. } => {
                        first_position.get_or_insert(position);
                        positions.push(position);
                        break;
                    }
                    ChunkAppend::NoRoom { frame_len } => {
                        if chunk.physical_data_size() == 0 {
                            return Err(StorageError::RecordTooLarge {
                                size: frame_len,
                                capacity: chunk.header().data_capacity(),
                            });
                        }
                        state.chunk = self.roll_over(&chunk).await?;
                    }
                }
            }
        }

        let end_position = state.chunk.next_log_position();
        self.checkpoints.writer.write(end_position)?;
        if self.config.sync_on_write {
            self.flush_locked(state).await?;
        }
        Ok(AppendResult {
            positions,
            end_position,
        })
    }

    /// Remove the frames of a failed batch from the current chunk
    ///
    /// Frames that already landed in a chunk completed during the batch
    /// cannot be removed, which is an error.
    async fn undo_batch(
        &self,
        state: &mut WriterState,
        batch_chunk: &Arc<Chunk>,
        batch_start: i64,
        writer_before: i64,
    ) -> Result<(), StorageError> {
        if !Arc::ptr_eq(&state.chunk, batch_chunk) {
            return Err(StorageError::corrupt(
                display_name(batch_chunk.path()),
                "batch spilled into a completed chunk",
            ));
        }
        batch_chunk.rewind(batch_start).await?;
        self.checkpoints.writer.reset(writer_before);
        self.checkpoints.writer.flush().await?;

        // Rewound positions were encrypted once already
        if batch_chunk.transform().kind() == TransformKind::Encrypted {
            state.chunk = self.roll_over(batch_chunk).await?;
        }
        Ok(())
    }

    async fn roll_over(&self, chunk: &Arc<Chunk>) -> Result<Arc<Chunk>, StorageError> {
        chunk.complete().await?;
        self.checkpoints.writer.write(chunk.end_position())?;
        let next = self.manager.add_new_chunk(chunk.end_number() + 1).await?;
        debug!(chunk = next.start_number(), "Rolled over to new chunk");
        Ok(next)
    }

    /// Complete the current chunk and start a new one
    pub async fn complete_current_chunk(&self) -> Result<(), StorageError> {
        let mut guard = self.writer.lock().await;
        let state = guard.as_mut().ok_or(StorageError::Closed)?;
        let current = Arc::clone(&state.chunk);
        state.chunk = self.roll_over(&current).await?;
        self.flush_locked(state).await
    }

    /// Make appended data durable and visible to readers
    ///
    /// Chunk data is synced before the writer checkpoint, and the chaser
    /// only moves once the writer checkpoint is on disk.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let guard = self.writer.lock().await;
        let state = guard.as_ref().ok_or(StorageError::Closed)?;
        self.flush_locked(state).await
    }

    async fn flush_locked(&self, state: &WriterState) -> Result<(), StorageError> {
        state.chunk.flush().await?;
        self.checkpoints.writer.flush().await?;
        let writer = self.checkpoints.writer.read();
        if writer > self.checkpoints.chaser.read() {
            self.checkpoints.chaser.write(writer)?;
        }
        self.checkpoints.chaser.flush().await?;
        Ok(())
    }

    /// Read the record at `position`
    pub async fn read_at(&self, position: i64) -> Result<LogRecord, StorageError> {
        if position < 0 || position >= self.readable_position() {
            return Err(StorageError::not_found(format!("position {position}")));
        }
        let chunk = self
            .manager
            .get_chunk_for(position)
            .ok_or_else(|| StorageError::not_found(format!("chunk for position {position}")))?;
        chunk
            .read_record_at(position)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("position {position}")))
    }

    /// Every readable record at or after `from`, in log order
    pub async fn read_from(&self, from: i64) -> Result<Vec<LogRecord>, StorageError> {
        let limit = self.readable_position();
        let mut out = Vec::new();
        for chunk in self.manager.chunks() {
            if chunk.end_position() <= from || chunk.start_position() >= limit {
                continue;
            }
            for record in chunk.read_all_records().await? {
                let position = record.position();
                if position >= from && position < limit {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// Flush and release all files
    pub async fn close(&self) -> Result<(), StorageError> {
        let flushed = self.flush().await;
        self.writer.lock().await.take();
        self.manager.close().await;
        info!(path = %self.config.path.display(), "Closed chunk database");
        flushed
    }
}
