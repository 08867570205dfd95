//! Chunk files
//!
//! A chunk is a fixed-capacity file holding a contiguous range of the
//! transaction log. It is appended to by a single writer until it is
//! completed, after which it is immutable and only ever replaced as a
//! whole by a scavenged version.
//!
//! Records are framed as `[len: u32][transformed body][len: u32]`, all
//! little-endian. Unscavenged chunks store every record at its logical
//! position; scavenged chunks are compacted and carry a [`PosMap`] from
//! logical to physical positions.

pub mod format;
pub mod naming;
pub mod transform;

mod reader_pool;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use strand_core::LogRecord;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use format::{
    CHECKSUM_SIZE, ChunkFooter, ChunkHeader, FOOTER_SIZE, FRAME_OVERHEAD, HEADER_SIZE, PosMap,
};
use reader_pool::ReaderPool;
use transform::{ChunkTransform, TransformConfig, TransformKind};

const HASH_BLOCK_SIZE: usize = 64 * 1024;

/// Outcome of appending one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAppend {
    /// Frame written at `data_position`; the write cursor is now `end`
    Written { data_position: i64, end: i64 },
    /// The frame does not fit in the remaining capacity
    NoRoom { frame_len: usize },
}

struct ChunkWriter {
    file: File,
    hasher: blake3::Hasher,
    position: i64,
    pos_map: Vec<PosMap>,
}

/// A single chunk file, shared between the writer and readers
pub struct Chunk {
    path: PathBuf,
    header: ChunkHeader,
    transform: ChunkTransform,
    footer: OnceLock<ChunkFooter>,
    pos_map: OnceLock<Vec<PosMap>>,
    writer: Mutex<Option<ChunkWriter>>,
    physical_size: AtomicI64,
    logical_size: AtomicI64,
    readers: ReaderPool,
    delete_on_drop: AtomicBool,
    discarded_ciphertext: bool,
}

impl Chunk {
    /// Create a new writable chunk file
    ///
    /// The file is preallocated to its full capacity and the header plus
    /// transform header are written immediately.
    #[instrument(skip_all, fields(start = header.chunk_start_number, end = header.chunk_end_number))]
    pub async fn create(
        path: impl AsRef<Path>,
        header: ChunkHeader,
        transform: ChunkTransform,
        max_readers: usize,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        let data_offset = transform.data_offset();
        file.set_len(data_offset + header.data_capacity() as u64 + FOOTER_SIZE as u64)
            .await?;

        let header_bytes = header.to_bytes();
        let transform_header = transform.header_bytes();
        file.write_all(&header_bytes).await?;
        file.write_all(&transform_header).await?;
        file.flush().await?;
        file.sync_all().await?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&header_bytes);
        hasher.update(&transform_header);

        debug!(path = %path.display(), transform = ?transform.kind(), "Created chunk");

        Ok(Self::assemble(
            path,
            header,
            transform,
            Some(ChunkWriter {
                file,
                hasher,
                position: 0,
                pos_map: Vec::new(),
            }),
            max_readers,
        ))
    }

    /// Read a chunk's header and whether its footer marks it completed
    pub async fn probe(path: impl AsRef<Path>) -> Result<(ChunkHeader, bool), StorageError> {
        let path = path.as_ref();
        let name = display_name(path);
        let mut file = File::open(path).await?;
        let len = file.metadata().await?.len();
        if len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(StorageError::corrupt(name, format!("file too short: {len} bytes")));
        }

        let mut buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut buf).await?;
        let header = ChunkHeader::from_bytes(&buf).map_err(|e| rename_corrupt(e, &name))?;

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64))).await?;
        let mut buf = vec![0u8; FOOTER_SIZE];
        file.read_exact(&mut buf).await?;
        let footer = ChunkFooter::from_bytes(&buf).map_err(|e| rename_corrupt(e, &name))?;

        Ok((header, footer.is_completed))
    }

    /// Open a completed chunk read-only
    ///
    /// The file size must match what the footer describes. With
    /// `verify_hash` the whole content is re-hashed and compared against
    /// the footer.
    #[instrument(skip_all, fields(chunk = %display_name(path.as_ref())))]
    pub async fn open_completed(
        path: impl AsRef<Path>,
        config: &TransformConfig,
        verify_hash: bool,
        max_readers: usize,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let name = display_name(&path);
        let mut file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        if len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(StorageError::corrupt(&name, format!("file too short: {len} bytes")));
        }

        let (header, transform) = read_headers(&mut file, &name, config).await?;

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64))).await?;
        let mut buf = vec![0u8; FOOTER_SIZE];
        file.read_exact(&mut buf).await?;
        let footer = ChunkFooter::from_bytes(&buf).map_err(|e| rename_corrupt(e, &name))?;
        if !footer.is_completed {
            return Err(StorageError::corrupt(&name, "footer is not marked completed"));
        }

        let data_offset = transform.data_offset();
        let expected_len = data_offset
            + footer.physical_data_size as u64
            + footer.map_size as u64
            + FOOTER_SIZE as u64;
        if len != expected_len {
            return Err(StorageError::corrupt(
                &name,
                format!("file is {len} bytes but footer describes {expected_len}"),
            ));
        }
        if footer.physical_data_size as i64 > header.data_capacity() {
            return Err(StorageError::corrupt(&name, "physical data exceeds capacity"));
        }

        let pos_map = if footer.map_size > 0 {
            file.seek(SeekFrom::Start(data_offset + footer.physical_data_size as u64))
                .await?;
            let mut buf = vec![0u8; footer.map_size as usize];
            file.read_exact(&mut buf).await?;
            let map = PosMap::read_all(&buf, footer.map_entry_size());
            if map.windows(2).any(|w| w[0].log_pos >= w[1].log_pos) {
                return Err(StorageError::corrupt(&name, "position map is not sorted"));
            }
            map
        } else {
            Vec::new()
        };

        if verify_hash {
            let actual = hash_prefix(&mut file, len - CHECKSUM_SIZE as u64).await?;
            if actual != footer.hash {
                return Err(StorageError::HashMismatch {
                    chunk: name,
                    expected: hex::encode(footer.hash),
                    actual: hex::encode(actual),
                });
            }
        }

        let chunk = Self::assemble(path, header, transform, None, max_readers);
        chunk
            .physical_size
            .store(footer.physical_data_size as i64, Ordering::Release);
        chunk
            .logical_size
            .store(footer.logical_data_size, Ordering::Release);
        let _ = chunk.pos_map.set(pos_map);
        let _ = chunk.footer.set(footer);
        Ok(chunk)
    }

    /// Reopen the chunk the writer was appending to
    ///
    /// Anything past `write_position` was never acknowledged by the writer
    /// checkpoint and is zeroed. For encrypted chunks, whether that tail held
    /// any data is reported by [`Chunk::discarded_ciphertext`].
    #[instrument(skip_all, fields(chunk = %display_name(path.as_ref()), write_position))]
    pub async fn open_ongoing(
        path: impl AsRef<Path>,
        write_position: i64,
        config: &TransformConfig,
        max_readers: usize,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let name = display_name(&path);
        let mut file = OpenOptions::new().read(true).write(true).open(&path).await?;

        let (header, transform) = read_headers(&mut file, &name, config).await?;
        if header.is_scavenged {
            return Err(StorageError::corrupt(&name, "scavenged chunk cannot be ongoing"));
        }
        if write_position < 0 || write_position > header.data_capacity() {
            return Err(StorageError::corrupt(
                &name,
                format!(
                    "write position {write_position} outside capacity {}",
                    header.data_capacity()
                ),
            ));
        }

        let data_offset = transform.data_offset();
        let end = data_offset + write_position as u64;
        let full_len = data_offset + header.data_capacity() as u64 + FOOTER_SIZE as u64;
        let discarded_ciphertext = match transform.kind() {
            TransformKind::Encrypted => {
                let file_len = file.metadata().await?.len();
                let data_end = (data_offset + header.data_capacity() as u64).min(file_len);
                has_nonzero(&mut file, end, data_end).await?
            }
            _ => false,
        };
        file.set_len(end).await?;
        file.set_len(full_len).await?;

        let mut hasher = blake3::Hasher::new();
        file.seek(SeekFrom::Start(0)).await?;
        feed_hasher(&mut file, &mut hasher, end).await?;
        file.seek(SeekFrom::Start(end)).await?;

        debug!(write_position, discarded_ciphertext, "Reopened ongoing chunk");

        let mut chunk = Self::assemble(
            path,
            header,
            transform,
            Some(ChunkWriter {
                file,
                hasher,
                position: write_position,
                pos_map: Vec::new(),
            }),
            max_readers,
        );
        chunk.physical_size.store(write_position, Ordering::Release);
        chunk.logical_size.store(write_position, Ordering::Release);
        chunk.discarded_ciphertext = discarded_ciphertext;
        Ok(chunk)
    }

    fn assemble(
        path: PathBuf,
        header: ChunkHeader,
        transform: ChunkTransform,
        writer: Option<ChunkWriter>,
        max_readers: usize,
    ) -> Self {
        Self {
            readers: ReaderPool::new(path.clone(), max_readers),
            path,
            header,
            transform,
            footer: OnceLock::new(),
            pos_map: OnceLock::new(),
            writer: Mutex::new(writer),
            physical_size: AtomicI64::new(0),
            logical_size: AtomicI64::new(0),
            delete_on_drop: AtomicBool::new(false),
            discarded_ciphertext: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<&ChunkFooter> {
        self.footer.get()
    }

    pub fn transform(&self) -> &ChunkTransform {
        &self.transform
    }

    pub fn start_number(&self) -> i32 {
        self.header.chunk_start_number
    }

    pub fn end_number(&self) -> i32 {
        self.header.chunk_end_number
    }

    pub fn start_position(&self) -> i64 {
        self.header.chunk_start_position()
    }

    pub fn end_position(&self) -> i64 {
        self.header.chunk_end_position()
    }

    pub fn is_completed(&self) -> bool {
        self.footer.get().is_some()
    }

    pub fn is_scavenged(&self) -> bool {
        self.header.is_scavenged
    }

    /// True when reopening zeroed encrypted frames past the write cursor
    ///
    /// Positions in that range were already encrypted with this chunk's
    /// keystream, so the chunk must not be appended to again.
    pub fn discarded_ciphertext(&self) -> bool {
        self.discarded_ciphertext
    }

    /// Bytes of framed data in the data region
    pub fn physical_data_size(&self) -> i64 {
        self.physical_size.load(Ordering::Acquire)
    }

    /// Chunk-local logical size
    pub fn logical_data_size(&self) -> i64 {
        self.logical_size.load(Ordering::Acquire)
    }

    /// Global position the next appended record would get
    pub fn next_log_position(&self) -> i64 {
        self.start_position() + self.physical_data_size()
    }

    /// Size on disk
    pub fn file_size(&self) -> u64 {
        match self.footer.get() {
            Some(footer) => {
                self.transform.data_offset()
                    + footer.physical_data_size as u64
                    + footer.map_size as u64
                    + FOOTER_SIZE as u64
            }
            None => {
                self.transform.data_offset()
                    + self.header.data_capacity() as u64
                    + FOOTER_SIZE as u64
            }
        }
    }

    /// Append one record at the write cursor
    ///
    /// Unscavenged chunks require the record's position to equal the cursor
    /// position; scavenged chunks keep the record's original position and
    /// map it.
    pub async fn append(&self, record: &LogRecord) -> Result<ChunkAppend, StorageError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| StorageError::ReadOnly(display_name(&self.path)))?;

        if !self.header.is_scavenged
            && record.position() != self.start_position() + writer.position
        {
            return Err(StorageError::corrupt(
                display_name(&self.path),
                format!(
                    "record position {} does not match write cursor {}",
                    record.position(),
                    self.start_position() + writer.position
                ),
            ));
        }

        let data_position = writer.position;
        let frame = encode_frame(&self.transform, record, data_position)?;
        let frame_len = frame.len();
        if data_position + frame_len as i64 > self.header.data_capacity() {
            return Ok(ChunkAppend::NoRoom { frame_len });
        }

        writer.file.write_all(&frame).await?;
        writer.file.flush().await?;
        writer.hasher.update(&frame);

        if self.header.is_scavenged {
            writer.pos_map.push(PosMap::new(
                self.header.local_position(record.position()),
                data_position as i32,
            ));
        }
        writer.position += frame_len as i64;
        self.physical_size.store(writer.position, Ordering::Release);
        if !self.header.is_scavenged {
            self.logical_size.store(writer.position, Ordering::Release);
        }

        Ok(ChunkAppend::Written {
            data_position,
            end: writer.position,
        })
    }

    /// Drop every frame at or after `data_position`
    ///
    /// Undoes frames of a batch that failed part way. The dropped range is
    /// zeroed and the running hash is rebuilt from the kept prefix.
    #[instrument(skip(self), fields(chunk = %display_name(&self.path)))]
    pub async fn rewind(&self, data_position: i64) -> Result<(), StorageError> {
        let name = display_name(&self.path);
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| StorageError::ReadOnly(name.clone()))?;
        if self.header.is_scavenged || data_position < 0 || data_position > writer.position {
            return Err(StorageError::corrupt(
                name,
                format!("cannot rewind to {data_position} from {}", writer.position),
            ));
        }

        let data_offset = self.transform.data_offset();
        let end = data_offset + data_position as u64;
        let full_len = data_offset + self.header.data_capacity() as u64 + FOOTER_SIZE as u64;
        writer.file.flush().await?;
        writer.file.set_len(end).await?;
        writer.file.set_len(full_len).await?;

        let mut hasher = blake3::Hasher::new();
        writer.file.seek(SeekFrom::Start(0)).await?;
        feed_hasher(&mut writer.file, &mut hasher, end).await?;
        writer.file.seek(SeekFrom::Start(end)).await?;

        let dropped = writer.position - data_position;
        writer.hasher = hasher;
        writer.position = data_position;
        self.physical_size.store(data_position, Ordering::Release);
        self.logical_size.store(data_position, Ordering::Release);
        warn!(data_position, dropped, "Rewound chunk");
        Ok(())
    }

    /// Durably persist appended frames
    pub async fn flush(&self) -> Result<(), StorageError> {
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer.file.flush().await?;
            writer.file.sync_data().await?;
        }
        Ok(())
    }

    /// Complete an unscavenged chunk
    pub async fn complete(&self) -> Result<ChunkFooter, StorageError> {
        let logical = self.physical_data_size();
        self.finish(logical).await
    }

    /// Complete a scavenged chunk, keeping the logical size it replaces
    pub async fn complete_scavenged(&self, logical_data_size: i64) -> Result<ChunkFooter, StorageError> {
        self.finish(logical_data_size).await
    }

    #[instrument(skip(self), fields(chunk = %display_name(&self.path)))]
    async fn finish(&self, logical_data_size: i64) -> Result<ChunkFooter, StorageError> {
        let mut guard = self.writer.lock().await;
        let mut writer = guard
            .take()
            .ok_or_else(|| StorageError::ReadOnly(display_name(&self.path)))?;

        let mut map_bytes = Vec::with_capacity(writer.pos_map.len() * PosMap::FULL_SIZE);
        for entry in &writer.pos_map {
            entry.write_full(&mut map_bytes);
        }
        writer.file.write_all(&map_bytes).await?;
        writer.hasher.update(&map_bytes);

        let footer = ChunkFooter::new(
            writer.position as i32,
            logical_data_size,
            map_bytes.len() as i32,
        );
        let unhashed = footer.to_bytes();
        writer
            .hasher
            .update(&unhashed[..FOOTER_SIZE - CHECKSUM_SIZE]);
        let footer = footer.with_hash(truncate_hash(writer.hasher.finalize()));

        writer.file.write_all(&footer.to_bytes()).await?;
        writer.file.flush().await?;
        let final_len = self.transform.data_offset()
            + writer.position as u64
            + map_bytes.len() as u64
            + FOOTER_SIZE as u64;
        writer.file.set_len(final_len).await?;
        writer.file.sync_all().await?;

        self.logical_size.store(logical_data_size, Ordering::Release);
        let _ = self.pos_map.set(std::mem::take(&mut writer.pos_map));
        let _ = self.footer.set(footer.clone());

        debug!(
            physical = footer.physical_data_size,
            logical = footer.logical_data_size,
            map_entries = footer.map_count(),
            "Completed chunk"
        );
        Ok(footer)
    }

    /// Read the record stored at a global log position
    ///
    /// Returns `None` when the position is outside this chunk, past the
    /// written data, or was removed by a scavenge.
    pub async fn read_record_at(&self, position: i64) -> Result<Option<LogRecord>, StorageError> {
        if !self.header.contains(position) {
            return Ok(None);
        }
        let local = self.header.local_position(position);
        let physical = if self.header.is_scavenged {
            let Some(map) = self.pos_map.get() else {
                return Ok(None);
            };
            match PosMap::lookup(map, local) {
                Some(actual) => actual as i64,
                None => return Ok(None),
            }
        } else {
            local
        };

        if physical + FRAME_OVERHEAD as i64 > self.physical_data_size() {
            return Ok(None);
        }
        let record = self.read_frame(physical).await?;
        if record.position() != position {
            return Err(StorageError::corrupt(
                display_name(&self.path),
                format!(
                    "record at {position} claims position {}",
                    record.position()
                ),
            ));
        }
        Ok(Some(record))
    }

    async fn read_frame(&self, physical: i64) -> Result<LogRecord, StorageError> {
        let name = display_name(&self.path);
        let limit = self.physical_data_size();
        let mut reader = self.readers.acquire().await?;
        reader
            .seek(SeekFrom::Start(self.transform.transform_data_position(physical)))
            .await?;

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as i64;
        if physical + len + FRAME_OVERHEAD as i64 > limit {
            return Err(StorageError::corrupt(
                name,
                format!("frame at {physical} of length {len} runs past data end {limit}"),
            ));
        }

        let mut rest = vec![0u8; len as usize + 4];
        reader.read_exact(&mut rest).await?;
        drop(reader);

        let (stored, suffix) = rest.split_at(len as usize);
        if suffix != len_bytes {
            return Err(StorageError::corrupt(
                name,
                format!("frame at {physical} has mismatched length suffix"),
            ));
        }
        let body = self.transform.decode(physical + 4, stored)?;
        Ok(LogRecord::decode(&body)?)
    }

    /// Decode every record in the data region, in order
    pub async fn read_all_records(&self) -> Result<Vec<LogRecord>, StorageError> {
        let name = display_name(&self.path);
        let limit = self.physical_data_size();
        let mut data = vec![0u8; limit as usize];
        {
            let mut reader = self.readers.acquire().await?;
            reader
                .seek(SeekFrom::Start(self.transform.data_offset()))
                .await?;
            reader.read_exact(&mut data).await?;
        }

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            if offset + FRAME_OVERHEAD > data.len() {
                return Err(StorageError::corrupt(&name, format!("torn frame at {offset}")));
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&data[offset..offset + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            let end = offset + 4 + len;
            if end + 4 > data.len() || data[end..end + 4] != len_bytes {
                return Err(StorageError::corrupt(
                    &name,
                    format!("frame at {offset} has invalid length {len}"),
                ));
            }
            let body = self
                .transform
                .decode((offset + 4) as i64, &data[offset + 4..end])?;
            records.push(LogRecord::decode(&body)?);
            offset = end + 4;
        }
        Ok(records)
    }

    /// Delete the file once the last reference is dropped
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    /// Release file handles
    pub async fn close(&self) {
        self.readers.close();
        self.writer.lock().await.take();
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("path", &self.path)
            .field("start", &self.header.chunk_start_number)
            .field("end", &self.header.chunk_end_number)
            .field("scavenged", &self.header.is_scavenged)
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            self.readers.close();
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to delete chunk file");
            } else {
                debug!(path = %self.path.display(), "Deleted chunk file");
            }
        }
    }
}

async fn read_headers(
    file: &mut File,
    name: &str,
    config: &TransformConfig,
) -> Result<(ChunkHeader, ChunkTransform), StorageError> {
    file.seek(SeekFrom::Start(0)).await?;
    let mut buf = vec![0u8; HEADER_SIZE];
    file.read_exact(&mut buf).await?;
    let header = ChunkHeader::from_bytes(&buf).map_err(|e| rename_corrupt(e, name))?;

    let mut transform_header = vec![0u8; header.transform.header_len()];
    file.read_exact(&mut transform_header).await?;
    let transform = ChunkTransform::from_header(header.transform, &transform_header, config)?;
    Ok((header, transform))
}

/// Frame a record for storage at `data_position`: `[len][body][len]`
pub(crate) fn encode_frame(
    transform: &ChunkTransform,
    record: &LogRecord,
    data_position: i64,
) -> Result<Vec<u8>, StorageError> {
    let body = record.encode()?;
    let stored = transform.encode(data_position + 4, &body)?;
    let len_bytes = (stored.len() as u32).to_le_bytes();
    let mut frame = Vec::with_capacity(stored.len() + FRAME_OVERHEAD);
    frame.extend_from_slice(&len_bytes);
    frame.extend_from_slice(&stored);
    frame.extend_from_slice(&len_bytes);
    Ok(frame)
}

async fn has_nonzero(file: &mut File, from: u64, to: u64) -> Result<bool, StorageError> {
    if from >= to {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(from)).await?;
    let mut remaining = to - from;
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    while remaining > 0 {
        let take = remaining.min(HASH_BLOCK_SIZE as u64) as usize;
        file.read_exact(&mut buf[..take]).await?;
        if buf[..take].iter().any(|b| *b != 0) {
            return Ok(true);
        }
        remaining -= take as u64;
    }
    Ok(false)
}

async fn feed_hasher(file: &mut File, hasher: &mut blake3::Hasher, len: u64) -> Result<(), StorageError> {
    let mut remaining = len;
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    while remaining > 0 {
        let take = remaining.min(HASH_BLOCK_SIZE as u64) as usize;
        file.read_exact(&mut buf[..take]).await?;
        hasher.update(&buf[..take]);
        remaining -= take as u64;
    }
    Ok(())
}

async fn hash_prefix(file: &mut File, len: u64) -> Result<[u8; CHECKSUM_SIZE], StorageError> {
    file.seek(SeekFrom::Start(0)).await?;
    let mut hasher = blake3::Hasher::new();
    feed_hasher(file, &mut hasher, len).await?;
    Ok(truncate_hash(hasher.finalize()))
}

fn truncate_hash(hash: blake3::Hash) -> [u8; CHECKSUM_SIZE] {
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_SIZE]);
    out
}

fn rename_corrupt(err: StorageError, name: &str) -> StorageError {
    match err {
        StorageError::Corrupt { reason, .. } => StorageError::corrupt(name, reason),
        other => other,
    }
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::PrepareRecord;
    use tempfile::TempDir;
    use transform::EncryptionKey;

    const CHUNK_SIZE: i32 = 4096;

    fn prepare(stream: &str, position: i64) -> LogRecord {
        let mut record = LogRecord::from(PrepareRecord::new(stream, -2, "Test", &b"payload"[..]));
        record.set_position(position);
        record.set_transaction_position(position);
        record
    }

    async fn new_chunk(dir: &TempDir, number: i32, config: &TransformConfig) -> Chunk {
        let header = ChunkHeader::new(CHUNK_SIZE, number, number, false, config.kind);
        let transform = ChunkTransform::for_new_chunk(config).unwrap();
        let path = dir.path().join(format!("chunk-{number:06}.000000"));
        Chunk::create(path, header, transform, 2).await.unwrap()
    }

    async fn fill(chunk: &Chunk, count: usize) -> Vec<i64> {
        let mut positions = Vec::new();
        for i in 0..count {
            let position = chunk.next_log_position();
            let record = prepare(&format!("s-{i}"), position);
            assert!(matches!(
                chunk.append(&record).await.unwrap(),
                ChunkAppend::Written { .. }
            ));
            positions.push(position);
        }
        positions
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        let positions = fill(&chunk, 3).await;

        assert_eq!(positions[0], 0);
        for position in &positions {
            let record = chunk.read_record_at(*position).await.unwrap().unwrap();
            assert_eq!(record.position(), *position);
        }
        assert!(chunk.read_record_at(CHUNK_SIZE as i64 - 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_position_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        let record = prepare("s", 100);
        assert!(matches!(
            chunk.append(&record).await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_room_when_full() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        loop {
            let record = prepare("s", chunk.next_log_position());
            if let ChunkAppend::NoRoom { frame_len } = chunk.append(&record).await.unwrap() {
                assert!(chunk.physical_data_size() + frame_len as i64 > CHUNK_SIZE as i64);
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_complete_then_reopen_verifies_hash() {
        let dir = TempDir::new().unwrap();
        let config = TransformConfig::checksum();
        let chunk = new_chunk(&dir, 0, &config).await;
        let positions = fill(&chunk, 5).await;
        let footer = chunk.complete().await.unwrap();
        assert!(chunk.is_completed());
        assert_eq!(footer.logical_data_size, footer.physical_data_size as i64);

        let path = chunk.path().to_path_buf();
        let size = chunk.file_size();
        drop(chunk);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);

        let (header, completed) = Chunk::probe(&path).await.unwrap();
        assert!(completed);
        assert_eq!(header.transform, TransformKind::Checksum);

        let reopened = Chunk::open_completed(&path, &config, true, 2).await.unwrap();
        let record = reopened.read_record_at(positions[4]).await.unwrap().unwrap();
        assert_eq!(record.position(), positions[4]);
        assert_eq!(reopened.read_all_records().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_hash_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        fill(&chunk, 2).await;
        chunk.complete().await.unwrap();
        let path = chunk.path().to_path_buf();
        drop(chunk);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 10] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = Chunk::open_completed(&path, &TransformConfig::identity(), true, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::HashMismatch { .. }));

        // Without verification the structure is still valid
        assert!(Chunk::open_completed(&path, &TransformConfig::identity(), false, 2)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_identical_content_gives_identical_hash() {
        let dir = TempDir::new().unwrap();
        let header = ChunkHeader::new(CHUNK_SIZE, 0, 0, false, TransformKind::Identity);
        let first = Chunk::create(dir.path().join("a"), header.clone(), ChunkTransform::Identity, 2)
            .await
            .unwrap();
        let second = Chunk::create(dir.path().join("b"), header, ChunkTransform::Identity, 2)
            .await
            .unwrap();

        for i in 0..4 {
            let record = prepare(&format!("s-{i}"), first.next_log_position());
            first.append(&record).await.unwrap();
            second.append(&record).await.unwrap();
        }
        let a = first.complete().await.unwrap();
        let b = second.complete().await.unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(
            std::fs::read(first.path()).unwrap(),
            std::fs::read(second.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_single_bit_flip_changes_hash() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        fill(&chunk, 3).await;
        let footer = chunk.complete().await.unwrap();
        let path = chunk.path().to_path_buf();
        drop(chunk);

        let bytes = std::fs::read(&path).unwrap();
        let hashed_len = (bytes.len() - CHECKSUM_SIZE) as u64;
        let mut file = File::open(&path).await.unwrap();
        assert_eq!(hash_prefix(&mut file, hashed_len).await.unwrap(), footer.hash);

        for offset in [0, HEADER_SIZE + 20, bytes.len() - FOOTER_SIZE + 1] {
            let mut flipped = bytes.clone();
            flipped[offset] ^= 0x01;
            let flipped_path = dir.path().join(format!("flipped-{offset}"));
            std::fs::write(&flipped_path, &flipped).unwrap();
            let mut file = File::open(&flipped_path).await.unwrap();
            assert_ne!(hash_prefix(&mut file, hashed_len).await.unwrap(), footer.hash);
        }
    }

    #[tokio::test]
    async fn test_rewind_drops_frames_and_keeps_hash_consistent() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        let positions = fill(&chunk, 3).await;

        chunk.rewind(positions[1]).await.unwrap();
        assert_eq!(chunk.physical_data_size(), positions[1]);
        assert!(chunk.read_record_at(positions[1]).await.unwrap().is_none());

        let record = prepare("replacement", chunk.next_log_position());
        chunk.append(&record).await.unwrap();
        chunk.complete().await.unwrap();
        let path = chunk.path().to_path_buf();
        drop(chunk);

        let reopened = Chunk::open_completed(&path, &TransformConfig::identity(), true, 2)
            .await
            .unwrap();
        let records = reopened.read_all_records().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].as_prepare().unwrap().stream_id, "replacement");
    }

    #[tokio::test]
    async fn test_rewind_past_cursor_rejected() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        fill(&chunk, 1).await;
        let end = chunk.physical_data_size();
        assert!(matches!(
            chunk.rewind(end + 1).await,
            Err(StorageError::Corrupt { .. })
        ));
        tokio_test::assert_err!(chunk.rewind(-1).await);
    }

    #[tokio::test]
    async fn test_reopened_encrypted_chunk_reports_discarded_ciphertext() {
        let dir = TempDir::new().unwrap();
        let config = TransformConfig::encrypted(EncryptionKey::derive("pw"));
        let chunk = new_chunk(&dir, 0, &config).await;
        let positions = fill(&chunk, 3).await;
        chunk.flush().await.unwrap();
        let path = chunk.path().to_path_buf();
        drop(chunk);

        // The third frame was never acknowledged
        {
            let reopened = Chunk::open_ongoing(&path, positions[2], &config, 2).await.unwrap();
            assert!(reopened.discarded_ciphertext());
        }

        // Its bytes are zeroed now, so a second reopen drops nothing
        let reopened = Chunk::open_ongoing(&path, positions[2], &config, 2).await.unwrap();
        assert!(!reopened.discarded_ciphertext());
    }

    #[tokio::test]
    async fn test_truncated_completed_chunk_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        fill(&chunk, 2).await;
        chunk.complete().await.unwrap();
        let path = chunk.path().to_path_buf();
        drop(chunk);

        let bytes = std::fs::read(&path).unwrap();
        let mut shortened = bytes[..bytes.len() - FOOTER_SIZE - 3].to_vec();
        shortened.extend_from_slice(&bytes[bytes.len() - FOOTER_SIZE..]);
        std::fs::write(&path, &shortened).unwrap();

        let err = Chunk::open_completed(&path, &TransformConfig::identity(), false, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_open_ongoing_zeroes_tail() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        let positions = fill(&chunk, 3).await;
        chunk.flush().await.unwrap();
        let path = chunk.path().to_path_buf();
        drop(chunk);

        // Only the first two records were acknowledged
        let reopened = Chunk::open_ongoing(&path, positions[2], &TransformConfig::identity(), 2)
            .await
            .unwrap();
        assert_eq!(reopened.physical_data_size(), positions[2]);
        assert!(reopened.read_record_at(positions[2]).await.unwrap().is_none());

        let bytes = std::fs::read(&path).unwrap();
        let tail_start = HEADER_SIZE + positions[2] as usize;
        assert!(bytes[tail_start..tail_start + 64].iter().all(|b| *b == 0));

        // Writing continues at the cursor
        let record = prepare("next", reopened.next_log_position());
        reopened.append(&record).await.unwrap();
        reopened.complete().await.unwrap();
        drop(reopened);
        assert!(Chunk::open_completed(&path, &TransformConfig::identity(), true, 2)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_completed_chunk_is_read_only() {
        let dir = TempDir::new().unwrap();
        let chunk = new_chunk(&dir, 0, &TransformConfig::identity()).await;
        chunk.complete().await.unwrap();
        let record = prepare("s", 0);
        assert!(matches!(
            chunk.append(&record).await,
            Err(StorageError::ReadOnly(_))
        ));
    }

    #[tokio::test]
    async fn test_scavenged_chunk_maps_positions() {
        let dir = TempDir::new().unwrap();
        let header = ChunkHeader::new(CHUNK_SIZE, 0, 0, true, TransformKind::Identity);
        let path = dir.path().join("scavenged.tmp");
        let chunk = Chunk::create(&path, header, ChunkTransform::Identity, 2)
            .await
            .unwrap();

        for position in [120, 700, 1900] {
            chunk.append(&prepare("s", position)).await.unwrap();
        }
        let footer = chunk.complete_scavenged(2100).await.unwrap();
        assert_eq!(footer.map_count(), 3);
        assert_eq!(footer.logical_data_size, 2100);

        assert_eq!(
            chunk.read_record_at(700).await.unwrap().unwrap().position(),
            700
        );
        assert!(chunk.read_record_at(0).await.unwrap().is_none());
        drop(chunk);

        let reopened = Chunk::open_completed(&path, &TransformConfig::identity(), true, 2)
            .await
            .unwrap();
        assert_eq!(
            reopened.read_record_at(1900).await.unwrap().unwrap().position(),
            1900
        );
    }

    #[tokio::test]
    async fn test_encrypted_chunk_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = TransformConfig::encrypted(EncryptionKey::derive("pw"));
        let chunk = new_chunk(&dir, 0, &config).await;
        let positions = fill(&chunk, 3).await;
        chunk.complete().await.unwrap();
        let path = chunk.path().to_path_buf();
        drop(chunk);

        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(7).any(|w| w == b"payload"));

        let reopened = Chunk::open_completed(&path, &config, true, 2).await.unwrap();
        let record = reopened.read_record_at(positions[1]).await.unwrap().unwrap();
        assert_eq!(record.as_prepare().unwrap().data.as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_deleted_on_last_drop() {
        let dir = TempDir::new().unwrap();
        let chunk = std::sync::Arc::new(new_chunk(&dir, 0, &TransformConfig::identity()).await);
        let path = chunk.path().to_path_buf();
        let reader = std::sync::Arc::clone(&chunk);

        chunk.mark_for_deletion();
        drop(chunk);
        assert!(path.exists());
        drop(reader);
        assert!(!path.exists());
    }
}
