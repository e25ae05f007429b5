//! Hierarchical byte store: read a disc file whole or by byte range.
//!
//! Paths are relative to the disc root and use `/` separators, e.g.
//! `BDMV/STREAM/00001.m2ts`.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("range {offset}+{len} outside {path} ({size} bytes)")]
    OutOfRange {
        path: String,
        offset: u64,
        len: u64,
        size: u64,
    },
}

/// Disc file locations.
pub mod disc_path {
    pub const INDEX: &str = "BDMV/index.bdmv";
    pub const MOVIE_OBJECT: &str = "BDMV/MovieObject.bdmv";

    pub fn clip_info(clip_id: &str) -> String {
        format!("BDMV/CLIPINF/{}.clpi", clip_id)
    }

    pub fn stream(clip_id: &str) -> String {
        format!("BDMV/STREAM/{}.m2ts", clip_id)
    }

    pub fn playlist(number: u32) -> String {
        format!("BDMV/PLAYLIST/{:05}.mpls", number)
    }
}

#[async_trait]
pub trait ByteStore: Send + Sync {
    async fn read_all(&self, path: &str) -> Result<Bytes, StoreError>;

    /// Reads up to `len` bytes at `offset`. Short only at end of file.
    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StoreError>;

    async fn len(&self, path: &str) -> Result<u64, StoreError>;
}

// ============================================================================
// Filesystem
// ============================================================================

/// A disc directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsByteStore {
    root: PathBuf,
}

impl FsByteStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|c| !c.is_empty())
            .fold(self.root.clone(), |p, c| p.join(c))
    }

    fn map_err(path: &str, e: std::io::Error) -> StoreError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(path.to_string())
        } else {
            StoreError::Io(e)
        }
    }
}

#[async_trait]
impl ByteStore for FsByteStore {
    async fn read_all(&self, path: &str) -> Result<Bytes, StoreError> {
        let data = tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        let mut file = tokio::fs::File::open(self.resolve(path))
            .await
            .map_err(|e| Self::map_err(path, e))?;
        let size = file.metadata().await?.len();
        if offset > size {
            return Err(StoreError::OutOfRange {
                path: path.to_string(),
                offset,
                len: len as u64,
                size,
            });
        }
        file.seek(SeekFrom::Start(offset)).await?;

        let want = len.min((size - offset) as usize);
        let mut buf = Vec::with_capacity(want);
        file.take(want as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn len(&self, path: &str) -> Result<u64, StoreError> {
        let meta = tokio::fs::metadata(self.resolve(path))
            .await
            .map_err(|e| Self::map_err(path, e))?;
        Ok(meta.len())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// In-memory disc image, shareable across sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.files.write().insert(path.into(), data.into());
    }

    pub fn remove(&self, path: &str) -> Option<Bytes> {
        self.files.write().remove(path)
    }

    fn get(&self, path: &str) -> Result<Bytes, StoreError> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl ByteStore for MemoryStore {
    async fn read_all(&self, path: &str) -> Result<Bytes, StoreError> {
        self.get(path)
    }

    async fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, StoreError> {
        let data = self.get(path)?;
        let size = data.len() as u64;
        if offset > size {
            return Err(StoreError::OutOfRange {
                path: path.to_string(),
                offset,
                len: len as u64,
                size,
            });
        }
        let start = offset as usize;
        let end = start.saturating_add(len).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn len(&self, path: &str) -> Result<u64, StoreError> {
        Ok(self.get(path)?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disc_paths() {
        assert_eq!(disc_path::clip_info("00001"), "BDMV/CLIPINF/00001.clpi");
        assert_eq!(disc_path::stream("00001"), "BDMV/STREAM/00001.m2ts");
        assert_eq!(disc_path::playlist(7), "BDMV/PLAYLIST/00007.mpls");
    }

    #[tokio::test]
    async fn memory_store_ranges() {
        let store = MemoryStore::new();
        store.insert("BDMV/index.bdmv", (0u8..100).collect::<Vec<_>>());

        assert_eq!(store.len("BDMV/index.bdmv").await.unwrap(), 100);
        let range = store.read_range("BDMV/index.bdmv", 90, 50).await.unwrap();
        assert_eq!(&range[..], &(90u8..100).collect::<Vec<_>>()[..]);
        assert!(store.read_range("BDMV/index.bdmv", 100, 1).await.unwrap().is_empty());
        assert!(matches!(
            store.read_range("BDMV/index.bdmv", 101, 1).await,
            Err(StoreError::OutOfRange { size: 100, .. })
        ));
        assert!(matches!(store.read_all("BDMV/missing").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn fs_store_reads_disc_tree() {
        let dir = tempfile::tempdir().unwrap();
        let stream_dir = dir.path().join("BDMV").join("STREAM");
        std::fs::create_dir_all(&stream_dir).unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        std::fs::write(stream_dir.join("00001.m2ts"), &data).unwrap();

        let store = FsByteStore::new(dir.path());
        let path = disc_path::stream("00001");
        assert_eq!(store.len(&path).await.unwrap(), 1000);
        assert_eq!(&store.read_all(&path).await.unwrap()[..], &data[..]);
        let range = store.read_range(&path, 960, 100).await.unwrap();
        assert_eq!(&range[..], &data[960..]);

        assert!(matches!(
            store.read_all(disc_path::INDEX).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
