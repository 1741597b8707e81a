//! Stat and fetch collaborators.
//!
//! The core never touches the filesystem or network directly; it asks a
//! [`ResourceSource`] for a modification time and a stream of byte chunks.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::trace;

use crate::resource::{ModificationStamp, ResourceKey};

/// Size of the chunks [`LocalSource`] streams.
pub const FETCH_CHUNK_SIZE: usize = 64 * 1024;

/// Stat or fetch failure reported by a [`ResourceSource`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl SourceError {
    fn from_io(err: io::Error, key: &ResourceKey) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(key.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(key.to_string()),
            _ => Self::Io(format!("{}: {}", key, err)),
        }
    }
}

/// Result of a stat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceStat {
    pub modified: ModificationStamp,
    pub size: u64,
    pub is_dir: bool,
}

/// Stream of byte chunks, ended by `Ok(None)`.
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError>;
}

/// Where loaders and thumbnail jobs get resources from.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    async fn stat(&self, key: &ResourceKey) -> Result<ResourceStat, SourceError>;

    async fn fetch(&self, key: &ResourceKey) -> Result<Box<dyn ChunkStream>, SourceError>;

    /// Synchronous stat for resources where it costs next to nothing.
    /// `None` means "use [`ResourceSource::stat`]".
    fn fast_stat(&self, _key: &ResourceKey) -> Option<Result<ResourceStat, SourceError>> {
        None
    }
}

/// Source for `file://` resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSource;

impl LocalSource {
    fn path(key: &ResourceKey) -> Result<PathBuf, SourceError> {
        key.local_path()
            .ok_or_else(|| SourceError::UnsupportedScheme(key.scheme().to_string()))
    }

    fn stat_from_metadata(meta: &std::fs::Metadata, key: &ResourceKey) -> Result<ResourceStat, SourceError> {
        let modified = meta.modified().map_err(|e| SourceError::from_io(e, key))?;
        Ok(ResourceStat {
            modified: ModificationStamp::from_system_time(modified),
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }
}

#[async_trait]
impl ResourceSource for LocalSource {
    async fn stat(&self, key: &ResourceKey) -> Result<ResourceStat, SourceError> {
        let path = Self::path(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SourceError::from_io(e, key))?;
        Self::stat_from_metadata(&meta, key)
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<Box<dyn ChunkStream>, SourceError> {
        let path = Self::path(key)?;
        let file = File::open(&path)
            .await
            .map_err(|e| SourceError::from_io(e, key))?;
        trace!(?path, "Opened local file");
        Ok(Box::new(FileChunks {
            file,
            key: key.clone(),
        }))
    }

    fn fast_stat(&self, key: &ResourceKey) -> Option<Result<ResourceStat, SourceError>> {
        let path = key.local_path()?;
        Some(
            std::fs::metadata(&path)
                .map_err(|e| SourceError::from_io(e, key))
                .and_then(|meta| Self::stat_from_metadata(&meta, key)),
        )
    }
}

struct FileChunks {
    file: File,
    key: ResourceKey,
}

#[async_trait]
impl ChunkStream for FileChunks {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        let mut buf = vec![0u8; FETCH_CHUNK_SIZE];
        let n = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| SourceError::from_io(e, &self.key))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

/// Drain a stream into one buffer.
pub async fn read_all(mut stream: Box<dyn ChunkStream>) -> Result<Bytes, SourceError> {
    let mut data = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        data.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_stat_and_fetch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..(FETCH_CHUNK_SIZE * 2 + 10)).map(|i| i as u8).collect();
        std::fs::write(&path, &content).unwrap();
        let key = ResourceKey::from_path(&path).unwrap();

        let stat = LocalSource.stat(&key).await.unwrap();
        assert_eq!(stat.size, content.len() as u64);
        assert!(!stat.is_dir);
        assert_eq!(LocalSource.fast_stat(&key).unwrap().unwrap(), stat);

        let mut stream = LocalSource.fetch(&key).await.unwrap();
        let mut chunks = 0;
        let mut total = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            chunks += 1;
            total.extend_from_slice(&chunk);
        }
        assert!(chunks >= 3);
        assert_eq!(total, content);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let key = ResourceKey::from_path(std::path::Path::new("/nonexistent/img.png")).unwrap();
        let err = LocalSource.stat(&key).await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remote_scheme_rejected() {
        let key = ResourceKey::parse("http://example.com/a.png").unwrap();
        assert!(matches!(
            LocalSource.stat(&key).await,
            Err(SourceError::UnsupportedScheme(_))
        ));
        assert!(LocalSource.fast_stat(&key).is_none());
    }
}
