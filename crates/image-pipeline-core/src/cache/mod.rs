//! Memory and disk caches
//!
//! - [`CountingMemoryCache`]: reference-counted memory cache used for both
//!   decoded bitmaps and encoded bytes
//! - [`DiskStorageCache`]: size-bounded cache of encoded bytes over a blob
//!   store
//! - [`CacheKey`] and [`CacheKeyFactory`]: keys shared by all cache levels

mod counting;
mod disk;
mod key;
mod lru_map;
mod params;

pub use counting::{CountingMemoryCache, EntryStateObserver, MemoryCacheStats, ValueDescriptor};
pub use disk::{DiskCacheStats, DiskStorageCache};
pub use key::{BitmapCacheKey, CacheKey, CacheKeyFactory, DefaultCacheKeyFactory, PostprocessorKey};
pub use params::{EvictionPolicy, MemoryCacheParams};

use crate::image_data::DecodedImage;

/// Memory cache of decoded bitmaps
pub type BitmapMemoryCache = CountingMemoryCache<CacheKey, DecodedImage>;

/// Memory cache of encoded bytes
pub type EncodedMemoryCache = CountingMemoryCache<CacheKey, Vec<u8>>;

/// Bitmap cache sized by pixel buffer bytes
pub fn bitmap_memory_cache(params: MemoryCacheParams) -> BitmapMemoryCache {
    CountingMemoryCache::new("bitmap", params, |image: &DecodedImage| {
        image.size_in_bytes()
    })
}

/// Encoded cache sized by payload length
pub fn encoded_memory_cache(params: MemoryCacheParams) -> EncodedMemoryCache {
    CountingMemoryCache::new("encoded", params, |bytes: &Vec<u8>| bytes.len())
}
