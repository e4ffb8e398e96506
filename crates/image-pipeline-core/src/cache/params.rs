//! Memory cache limits

use serde::{Deserialize, Serialize};

/// Whether reading an entry refreshes its eviction position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// An entry's position is refreshed each time it becomes exclusive or
    /// is probed
    #[default]
    Lru,

    /// An entry keeps the position it got when first cached
    InsertionOrder,
}

/// Size and count limits for a [`CountingMemoryCache`](super::CountingMemoryCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCacheParams {
    /// Maximum total size of all tracked entries, in bytes
    pub max_cache_size: usize,

    /// Maximum number of tracked entries
    pub max_cache_entries: usize,

    /// Maximum total size of exclusively owned entries, in bytes
    pub max_eviction_queue_size: usize,

    /// Maximum number of exclusively owned entries
    pub max_eviction_queue_entries: usize,

    /// Largest single value the cache accepts, in bytes
    pub max_cache_entry_size: usize,

    pub eviction_policy: EvictionPolicy,
}

impl MemoryCacheParams {
    /// Limits with a byte budget and no count limits
    pub fn with_byte_budget(max_cache_size: usize) -> Self {
        Self {
            max_cache_size,
            max_cache_entries: usize::MAX,
            max_eviction_queue_size: max_cache_size,
            max_eviction_queue_entries: usize::MAX,
            max_cache_entry_size: max_cache_size,
            eviction_policy: EvictionPolicy::Lru,
        }
    }

    /// Defaults for decoded bitmaps: a quarter of 1 GiB
    pub fn bitmap_defaults() -> Self {
        Self {
            max_cache_size: 256 * 1024 * 1024,
            max_cache_entries: 256,
            max_eviction_queue_size: 256 * 1024 * 1024,
            max_eviction_queue_entries: 256,
            max_cache_entry_size: 64 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
        }
    }

    /// Defaults for encoded bytes
    pub fn encoded_defaults() -> Self {
        Self {
            max_cache_size: 32 * 1024 * 1024,
            max_cache_entries: 256,
            max_eviction_queue_size: 32 * 1024 * 1024,
            max_eviction_queue_entries: 256,
            max_cache_entry_size: 8 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
        }
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }
}

impl Default for MemoryCacheParams {
    fn default() -> Self {
        Self::bitmap_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_partial_override() {
        let params: MemoryCacheParams =
            serde_yaml::from_str("max_cache_size: 100\neviction_policy: insertion_order\n")
                .unwrap();
        assert_eq!(params.max_cache_size, 100);
        assert_eq!(params.eviction_policy, EvictionPolicy::InsertionOrder);
        assert_eq!(
            params.max_cache_entries,
            MemoryCacheParams::default().max_cache_entries
        );
    }
}
