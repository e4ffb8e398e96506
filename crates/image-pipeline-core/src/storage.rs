//! Keyed blob storage backing the disk cache
//!
//! Implementations:
//! - [`FileBlobStore`]: one file per blob in a directory; writes go to a
//!   temp file that is renamed into place on commit
//! - [`InMemoryBlobStore`]: map-backed store for tests and ephemeral use

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Summary of one stored blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub id: String,
    pub size: u64,

    /// Last write or touch
    pub timestamp: SystemTime,
}

/// Pending write to a blob store; nothing is visible until `commit`
#[async_trait]
pub trait BlobWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Keyed, opaque blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    async fn insert(&self, id: &str) -> Result<Box<dyn BlobWriter>>;

    async fn remove(&self, id: &str) -> Result<bool>;

    async fn contains(&self, id: &str) -> Result<bool>;

    async fn entries(&self) -> Result<Vec<BlobEntry>>;

    /// Refresh a blob's timestamp
    async fn touch(&self, id: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;
}

// ============================================================================
// File-backed store
// ============================================================================

const TEMP_SUFFIX: &str = ".tmp";
const BLOB_SUFFIX: &str = ".blob";

/// Blob store keeping one file per blob in a directory
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        debug!("Opened file blob store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(PipelineError::Storage(format!("invalid blob id '{id}'")));
        }
        Ok(self.root.join(format!("{id}{BLOB_SUFFIX}")))
    }
}

struct FileBlobWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: tokio::fs::File,
}

#[async_trait]
impl BlobWriter for FileBlobWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tokio::fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert(&self, id: &str) -> Result<Box<dyn BlobWriter>> {
        let final_path = self.blob_path(id)?;
        let nonce = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let temp_path = self.root.join(format!("{id}.{nonce}{TEMP_SUFFIX}"));
        let file = tokio::fs::File::create(&temp_path).await?;
        Ok(Box::new(FileBlobWriter {
            temp_path,
            final_path,
            file,
        }))
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        let path = self.blob_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.blob_path(id)?).await?)
    }

    async fn entries(&self) -> Result<Vec<BlobEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().to_string();
            let Some(id) = name.strip_suffix(BLOB_SUFFIX) else {
                continue;
            };
            let metadata = item.metadata().await?;
            entries.push(BlobEntry {
                id: id.to_string(),
                size: metadata.len(),
                timestamp: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    async fn touch(&self, id: &str) -> Result<bool> {
        let path = self.blob_path(id)?;
        let touched = tokio::task::spawn_blocking(move || {
            match std::fs::OpenOptions::new().append(true).open(&path) {
                Ok(file) => file.set_modified(SystemTime::now()).map(|()| true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| PipelineError::Executor(e.to_string()))??;
        Ok(touched)
    }

    async fn clear(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().to_string();
            if name.ends_with(BLOB_SUFFIX) || name.ends_with(TEMP_SUFFIX) {
                if let Err(e) = tokio::fs::remove_file(item.path()).await {
                    warn!("Failed to remove {}: {}", item.path().display(), e);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Map-backed blob store
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, (Vec<u8>, SystemTime)>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

struct InMemoryBlobWriter {
    id: String,
    buffer: Vec<u8>,
    blobs: Arc<Mutex<HashMap<String, (Vec<u8>, SystemTime)>>>,
}

#[async_trait]
impl BlobWriter for InMemoryBlobWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let writer = *self;
        writer
            .blobs
            .lock()
            .insert(writer.id, (writer.buffer, SystemTime::now()));
        Ok(())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(id).map(|(data, _)| data.clone()))
    }

    async fn insert(&self, id: &str) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(InMemoryBlobWriter {
            id: id.to_string(),
            buffer: Vec::new(),
            blobs: Arc::clone(&self.blobs),
        }))
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.blobs.lock().remove(id).is_some())
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.blobs.lock().contains_key(id))
    }

    async fn entries(&self) -> Result<Vec<BlobEntry>> {
        Ok(self
            .blobs
            .lock()
            .iter()
            .map(|(id, (data, timestamp))| BlobEntry {
                id: id.clone(),
                size: data.len() as u64,
                timestamp: *timestamp,
            })
            .collect())
    }

    async fn touch(&self, id: &str) -> Result<bool> {
        match self.blobs.lock().get_mut(id) {
            Some((_, timestamp)) => {
                *timestamp = SystemTime::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.blobs.lock().clear();
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_blob(store: &dyn BlobStore, id: &str, data: &[u8]) {
        let mut writer = store.insert(id).await.unwrap();
        writer.write(data).await.unwrap();
        writer.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).await.unwrap();

        assert_eq!(store.get("abc").await.unwrap(), None);
        write_blob(&store, "abc", b"hello").await;

        assert!(store.contains("abc").await.unwrap());
        assert_eq!(store.get("abc").await.unwrap().as_deref(), Some(&b"hello"[..]));
        assert!(store.touch("abc").await.unwrap());

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 5);

        assert!(store.remove("abc").await.unwrap());
        assert!(!store.remove("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_uncommitted_write_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).await.unwrap();

        let mut writer = store.insert("pending").await.unwrap();
        writer.write(b"partial").await.unwrap();
        assert!(!store.contains("pending").await.unwrap());
        assert!(store.entries().await.unwrap().is_empty());
        drop(writer);

        store.clear().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::open(dir.path()).await.unwrap();
        assert!(store.get("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryBlobStore::new();
        write_blob(&store, "k", b"data").await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").await.unwrap(), Some(b"data".to_vec()));
        store.clear().await.unwrap();
        assert!(store.is_empty());
    }
}
