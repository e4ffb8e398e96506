//! Size-bounded disk cache over a [`BlobStore`]

use super::key::CacheKey;
use crate::error::Result;
use crate::storage::BlobStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Counters for the disk cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

/// Disk cache keyed by [`CacheKey::resource_id`]
///
/// Reads refresh a blob's timestamp; when a write pushes the total size
/// over the limit, the least recently touched blobs are removed.
#[derive(Clone)]
pub struct DiskStorageCache {
    store: Arc<dyn BlobStore>,
    max_size_bytes: u64,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    writes: Arc<AtomicU64>,
    evictions: Arc<AtomicU64>,
}

impl DiskStorageCache {
    pub fn new(store: Arc<dyn BlobStore>, max_size_bytes: u64) -> Self {
        Self {
            store,
            max_size_bytes,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            writes: Arc::new(AtomicU64::new(0)),
            evictions: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>> {
        let id = key.resource_id();
        match self.store.get(&id).await? {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.store.touch(&id).await?;
                Ok(Some(data))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub async fn contains(&self, key: &CacheKey) -> Result<bool> {
        self.store.contains(&key.resource_id()).await
    }

    /// Store `data` under `key`, then evict down to the size limit
    pub async fn insert(&self, key: &CacheKey, data: &[u8]) -> Result<()> {
        let id = key.resource_id();
        let mut writer = self.store.insert(&id).await?;
        writer.write(data).await?;
        writer.commit().await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(resource_id = %id, bytes = data.len(), "Wrote disk cache entry");
        self.evict_to_limit().await
    }

    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        self.store.remove(&key.resource_id()).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        info!("Cleared disk cache");
        Ok(())
    }

    /// Total bytes currently stored
    pub async fn size_bytes(&self) -> Result<u64> {
        Ok(self.store.entries().await?.iter().map(|e| e.size).sum())
    }

    pub fn stats(&self) -> DiskCacheStats {
        DiskCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    async fn evict_to_limit(&self) -> Result<()> {
        let mut entries = self.store.entries().await?;
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= self.max_size_bytes {
            return Ok(());
        }

        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        for entry in entries {
            if total <= self.max_size_bytes {
                break;
            }
            if self.store.remove(&entry.id).await? {
                total = total.saturating_sub(entry.size);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(resource_id = %entry.id, size = entry.size, "Evicted disk cache entry");
            }
        }
        Ok(())
    }
}
