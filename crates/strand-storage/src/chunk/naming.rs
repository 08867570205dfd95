//! Chunk file naming
//!
//! Chunks are named `<prefix><start:06>.<version:06>`. A scavenge writes a
//! temporary `<uuid>.scavenge.tmp` file and renames it to the next version
//! once it is complete, so several versions of the same start number may
//! exist after a crash. The highest version wins.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::StorageError;

pub const DEFAULT_CHUNK_PREFIX: &str = "chunk-";
pub const TEMP_SUFFIX: &str = ".scavenge.tmp";

/// A chunk file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFileName {
    pub path: PathBuf,
    pub start_number: i32,
    pub version: i32,
}

/// Versioned pattern naming strategy
#[derive(Debug, Clone)]
pub struct ChunkNaming {
    dir: PathBuf,
    prefix: String,
}

impl ChunkNaming {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_prefix(dir, DEFAULT_CHUNK_PREFIX)
    }

    pub fn with_prefix(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn filename_for(&self, start_number: i32, version: i32) -> PathBuf {
        self.dir
            .join(format!("{}{:06}.{:06}", self.prefix, start_number, version))
    }

    pub fn temp_filename(&self) -> PathBuf {
        self.dir.join(format!("{}{}", Uuid::new_v4(), TEMP_SUFFIX))
    }

    /// Parse `<prefix>NNNNNN.VVVVVV`
    pub fn parse(&self, file_name: &str) -> Option<(i32, i32)> {
        let rest = file_name.strip_prefix(&self.prefix)?;
        let (number, version) = rest.split_once('.')?;
        if number.len() < 6 || version.len() < 6 {
            return None;
        }
        if !number.bytes().all(|b| b.is_ascii_digit()) || !version.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some((number.parse().ok()?, version.parse().ok()?))
    }

    /// Every chunk file in the directory, sorted by start number then
    /// descending version
    pub async fn list_chunks(&self) -> Result<Vec<ChunkFileName>, StorageError> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((start_number, version)) = self.parse(name) {
                found.push(ChunkFileName {
                    path: entry.path(),
                    start_number,
                    version,
                });
            }
        }
        found.sort_by(|a, b| {
            a.start_number
                .cmp(&b.start_number)
                .then(b.version.cmp(&a.version))
        });
        Ok(found)
    }

    /// All versions of one chunk, newest first
    pub async fn versions_of(&self, start_number: i32) -> Result<Vec<ChunkFileName>, StorageError> {
        Ok(self
            .list_chunks()
            .await?
            .into_iter()
            .filter(|f| f.start_number == start_number)
            .collect())
    }

    /// Leftover scavenge temp files
    pub async fn list_temp_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(TEMP_SUFFIX))
            {
                found.push(entry.path());
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_filename_format() {
        let naming = ChunkNaming::new("/db");
        assert_eq!(
            naming.filename_for(12, 3),
            PathBuf::from("/db/chunk-000012.000003")
        );
        let temp = naming.temp_filename();
        assert!(temp.to_string_lossy().ends_with(TEMP_SUFFIX));
    }

    #[test]
    fn test_parse() {
        let naming = ChunkNaming::new("/db");
        assert_eq!(naming.parse("chunk-000012.000003"), Some((12, 3)));
        assert_eq!(naming.parse("chunk-1234567.000001"), Some((1234567, 1)));
        assert_eq!(naming.parse("chunk-12.3"), None);
        assert_eq!(naming.parse("chunk-00001a.000000"), None);
        assert_eq!(naming.parse("writer.chk"), None);
    }

    #[tokio::test]
    async fn test_list_orders_versions_descending() {
        let dir = TempDir::new().unwrap();
        let naming = ChunkNaming::new(dir.path());
        for (n, v) in [(1, 0), (0, 0), (1, 2), (0, 1)] {
            tokio::fs::write(naming.filename_for(n, v), b"x").await.unwrap();
        }
        tokio::fs::write(naming.temp_filename(), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("writer.chk"), b"x").await.unwrap();

        let listed: Vec<_> = naming
            .list_chunks()
            .await
            .unwrap()
            .into_iter()
            .map(|f| (f.start_number, f.version))
            .collect();
        assert_eq!(listed, vec![(0, 1), (0, 0), (1, 2), (1, 0)]);

        let versions = naming.versions_of(1).await.unwrap();
        assert_eq!(versions[0].version, 2);
        assert_eq!(naming.list_temp_files().await.unwrap().len(), 1);
    }
}
