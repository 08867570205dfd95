//! Bounded pool of read handles for one chunk file

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::StorageError;

pub(crate) struct ReaderPool {
    path: PathBuf,
    permits: Semaphore,
    idle: Mutex<Vec<File>>,
}

impl ReaderPool {
    pub(crate) fn new(path: PathBuf, max_readers: usize) -> Self {
        Self {
            path,
            permits: Semaphore::new(max_readers.max(1)),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Borrow a handle, waiting if all handles are in use
    pub(crate) async fn acquire(&self) -> Result<PooledReader<'_>, StorageError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StorageError::Closed)?;
        let cached = self.idle.lock().pop();
        let file = match cached {
            Some(file) => file,
            None => File::open(&self.path).await?,
        };
        Ok(PooledReader {
            pool: self,
            file: Some(file),
            _permit: permit,
        })
    }

    /// Drop cached handles and refuse further acquisitions
    pub(crate) fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A pooled handle, returned to the pool on drop
pub(crate) struct PooledReader<'a> {
    pool: &'a ReaderPool,
    file: Option<File>,
    _permit: SemaphorePermit<'a>,
}

impl Deref for PooledReader<'_> {
    type Target = File;

    fn deref(&self) -> &File {
        // Only taken in drop
        self.file.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledReader<'_> {
    fn deref_mut(&mut self) -> &mut File {
        self.file.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if !self.pool.permits.is_closed() {
                self.pool.idle.lock().push(file);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_handles_are_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let pool = ReaderPool::new(path, 2);
        {
            let mut reader = pool.acquire().await.unwrap();
            let mut buf = String::new();
            reader.read_to_string(&mut buf).await.unwrap();
            assert_eq!(buf, "hello");
        }
        assert_eq!(pool.idle_count(), 1);

        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"x").await.unwrap();

        let pool = ReaderPool::new(path, 1);
        pool.close();
        assert!(matches!(pool.acquire().await, Err(StorageError::Closed)));
    }
}
