//! Chunk manager
//!
//! Owns the ordered list of chunks and resolves log positions to them. A
//! merged scavenged chunk covering numbers `a..=b` occupies every slot in
//! that range. Replacing a chunk swaps the slots under the write lock;
//! readers that already hold the old chunk keep using it until they drop
//! it, at which point its file is deleted.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::chunk::format::ChunkHeader;
use crate::chunk::naming::ChunkNaming;
use crate::chunk::transform::{ChunkTransform, TransformConfig};
use crate::chunk::{Chunk, display_name};
use crate::config::DbConfig;
use crate::error::StorageError;

pub struct ChunkManager {
    chunk_size: i32,
    max_readers: usize,
    naming: ChunkNaming,
    chunks: RwLock<Vec<Arc<Chunk>>>,
    /// Held while creating chunks so the active transform cannot change
    /// under a rollover
    transform: Mutex<TransformConfig>,
}

impl ChunkManager {
    pub fn new(config: &DbConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_readers: config.max_readers_per_chunk,
            naming: ChunkNaming::with_prefix(&config.path, config.chunk_prefix.clone()),
            chunks: RwLock::new(Vec::new()),
            transform: Mutex::new(config.transform.clone()),
        }
    }

    pub fn naming(&self) -> &ChunkNaming {
        &self.naming
    }

    pub fn chunk_size(&self) -> i32 {
        self.chunk_size
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers
    }

    /// Number of chunk slots
    pub fn chunk_count(&self) -> i32 {
        self.chunks.read().len() as i32
    }

    pub fn get_chunk(&self, number: i32) -> Option<Arc<Chunk>> {
        if number < 0 {
            return None;
        }
        self.chunks.read().get(number as usize).cloned()
    }

    pub fn get_chunk_for(&self, position: i64) -> Option<Arc<Chunk>> {
        if position < 0 {
            return None;
        }
        let number = position / self.chunk_size as i64;
        self.get_chunk(number as i32)
    }

    pub fn last_chunk(&self) -> Option<Arc<Chunk>> {
        self.chunks.read().last().cloned()
    }

    /// Every distinct chunk, in order
    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        let slots = self.chunks.read();
        let mut out: Vec<Arc<Chunk>> = Vec::new();
        for chunk in slots.iter() {
            if out.last().is_none_or(|last| !Arc::ptr_eq(last, chunk)) {
                out.push(Arc::clone(chunk));
            }
        }
        out
    }

    /// Register a chunk opened at startup
    ///
    /// Chunks must be added in order without gaps.
    pub fn add_chunk(&self, chunk: Arc<Chunk>) -> Result<(), StorageError> {
        let mut slots = self.chunks.write();
        if chunk.start_number() != slots.len() as i32 {
            return Err(StorageError::ChainGap {
                missing: slots.len() as i32,
            });
        }
        for _ in chunk.start_number()..=chunk.end_number() {
            slots.push(Arc::clone(&chunk));
        }
        Ok(())
    }

    /// Create and register the next writable chunk
    #[instrument(skip(self))]
    pub async fn add_new_chunk(&self, number: i32) -> Result<Arc<Chunk>, StorageError> {
        let config = self.transform.lock().await;
        if number != self.chunk_count() {
            return Err(StorageError::ChainGap {
                missing: self.chunk_count(),
            });
        }
        let header = ChunkHeader::new(self.chunk_size, number, number, false, config.kind);
        let transform = ChunkTransform::for_new_chunk(&config)?;
        let path = self.naming.filename_for(number, 0);
        let chunk = Arc::new(Chunk::create(&path, header, transform, self.max_readers).await?);
        self.add_chunk(Arc::clone(&chunk))?;
        info!(chunk = number, "Created new chunk");
        Ok(chunk)
    }

    /// Create an unregistered scavenged chunk covering `start..=end`
    pub async fn create_temp_chunk(&self, start: i32, end: i32) -> Result<Chunk, StorageError> {
        let config = self.transform.lock().await;
        let header = ChunkHeader::new(self.chunk_size, start, end, true, config.kind);
        let transform = ChunkTransform::for_new_chunk(&config)?;
        Chunk::create(self.naming.temp_filename(), header, transform, self.max_readers).await
    }

    /// Change the transform used for chunks created from now on
    pub async fn set_active_transform(&self, config: TransformConfig) {
        let mut active = self.transform.lock().await;
        info!(transform = ?config.kind, "Switching transform for new chunks");
        *active = config;
    }

    /// Transform used to open existing chunks
    pub async fn transform_config(&self) -> TransformConfig {
        self.transform.lock().await.clone()
    }

    /// Swap a completed scavenged chunk in for the chunks it covers
    ///
    /// The temp file is renamed to the next version of its start number and
    /// reopened. Returns `None` if the range no longer matches completed
    /// chunks, in which case the temp file is deleted.
    #[instrument(skip_all, fields(start = temp.start_number(), end = temp.end_number()))]
    pub async fn switch_chunk(&self, temp: Chunk, verify_hash: bool) -> Result<Option<Arc<Chunk>>, StorageError> {
        let start = temp.start_number();
        let end = temp.end_number();

        let replaced = {
            let slots = self.chunks.read();
            if end as usize >= slots.len() {
                None
            } else {
                let covered: Vec<Arc<Chunk>> = slots[start as usize..=end as usize].to_vec();
                let aligned = covered.first().is_some_and(|c| c.start_number() == start)
                    && covered.last().is_some_and(|c| c.end_number() == end)
                    && covered.iter().all(|c| c.is_completed());
                aligned.then_some(covered)
            }
        };
        let Some(replaced) = replaced else {
            debug!("Chunk range changed, discarding scavenged chunk");
            temp.mark_for_deletion();
            return Ok(None);
        };

        let version = self
            .naming
            .versions_of(start)
            .await?
            .first()
            .map(|f| f.version + 1)
            .unwrap_or(1);
        let target = self.naming.filename_for(start, version);
        temp.close().await;
        tokio::fs::rename(temp.path(), &target).await?;
        drop(temp);

        let config = self.transform_config().await;
        let chunk = Arc::new(Chunk::open_completed(&target, &config, verify_hash, self.max_readers).await?);

        {
            let mut slots = self.chunks.write();
            for slot in slots[start as usize..=end as usize].iter_mut() {
                *slot = Arc::clone(&chunk);
            }
        }

        let mut previous: Option<&Arc<Chunk>> = None;
        for old in &replaced {
            if previous.is_none_or(|p| !Arc::ptr_eq(p, old)) {
                old.mark_for_deletion();
            }
            previous = Some(old);
        }

        info!(file = %display_name(&target), "Switched in scavenged chunk");
        Ok(Some(chunk))
    }

    /// Drop every slot, closing file handles
    pub async fn close(&self) {
        let chunks = self.chunks();
        self.chunks.write().clear();
        for chunk in chunks {
            chunk.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::{LogRecord, PrepareRecord};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DbConfig {
        DbConfig::new(dir.path()).with_chunk_size(4096)
    }

    async fn write_one(chunk: &Chunk) -> i64 {
        let mut record = LogRecord::from(PrepareRecord::new("s", -2, "E", &b"data"[..]));
        let position = chunk.next_log_position();
        record.set_position(position);
        record.set_transaction_position(position);
        chunk.append(&record).await.unwrap();
        position
    }

    #[tokio::test]
    async fn test_new_chunks_resolve_positions() {
        let dir = TempDir::new().unwrap();
        let manager = ChunkManager::new(&config(&dir));
        manager.add_new_chunk(0).await.unwrap();
        manager.add_new_chunk(1).await.unwrap();

        assert_eq!(manager.chunk_count(), 2);
        assert_eq!(manager.get_chunk_for(0).unwrap().start_number(), 0);
        assert_eq!(manager.get_chunk_for(4096).unwrap().start_number(), 1);
        assert!(manager.get_chunk_for(8192).is_none());
        assert!(manager.get_chunk_for(-1).is_none());
        assert!(dir.path().join("chunk-000001.000000").exists());
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = ChunkManager::new(&config(&dir));
        assert!(matches!(
            manager.add_new_chunk(1).await,
            Err(StorageError::ChainGap { missing: 0 })
        ));
    }

    #[tokio::test]
    async fn test_switch_merged_chunk_fills_slots() {
        let dir = TempDir::new().unwrap();
        let manager = ChunkManager::new(&config(&dir));
        let mut positions = Vec::new();
        for number in 0..2 {
            let chunk = manager.add_new_chunk(number).await.unwrap();
            positions.push(write_one(&chunk).await);
            chunk.complete().await.unwrap();
        }

        let temp = manager.create_temp_chunk(0, 1).await.unwrap();
        for position in &positions {
            let old = manager.get_chunk_for(*position).unwrap();
            let record = old.read_record_at(*position).await.unwrap().unwrap();
            temp.append(&record).await.unwrap();
        }
        temp.complete_scavenged(8192).await.unwrap();

        let old_first = manager.get_chunk(0).unwrap();
        let merged = manager.switch_chunk(temp, true).await.unwrap().unwrap();
        assert_eq!(merged.path(), dir.path().join("chunk-000000.000001"));
        assert!(Arc::ptr_eq(&manager.get_chunk(0).unwrap(), &manager.get_chunk(1).unwrap()));
        assert_eq!(manager.chunks().len(), 1);

        // Old file lives until its last reader goes away
        let old_path = old_first.path().to_path_buf();
        assert!(old_path.exists());
        drop(old_first);
        assert!(!old_path.exists());
        assert!(!dir.path().join("chunk-000001.000000").exists());

        let record = manager
            .get_chunk_for(positions[1])
            .unwrap()
            .read_record_at(positions[1])
            .await
            .unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_switch_rejects_ongoing_range() {
        let dir = TempDir::new().unwrap();
        let manager = ChunkManager::new(&config(&dir));
        manager.add_new_chunk(0).await.unwrap();

        let temp = manager.create_temp_chunk(0, 0).await.unwrap();
        temp.complete_scavenged(0).await.unwrap();
        let temp_path = temp.path().to_path_buf();
        assert!(manager.switch_chunk(temp, false).await.unwrap().is_none());
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_set_active_transform_applies_to_new_chunks() {
        let dir = TempDir::new().unwrap();
        let manager = ChunkManager::new(&config(&dir));
        manager.add_new_chunk(0).await.unwrap();
        manager.set_active_transform(TransformConfig::checksum()).await;
        let chunk = manager.add_new_chunk(1).await.unwrap();
        assert_eq!(
            chunk.header().transform,
            crate::chunk::transform::TransformKind::Checksum
        );
        assert_eq!(
            manager.get_chunk(0).unwrap().header().transform,
            crate::chunk::transform::TransformKind::Identity
        );
    }
}
