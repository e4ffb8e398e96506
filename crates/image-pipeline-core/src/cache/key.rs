//! Cache keys for encoded and decoded images

use crate::request::{DecodeOptions, ImageRequest, ResizeOptions, RotationOptions};
use serde::{Deserialize, Serialize};

/// Identity of a postprocessor's output inside a bitmap key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostprocessorKey {
    pub name: String,
    pub key: String,
}

/// Key of a decoded (optionally postprocessed) bitmap
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitmapCacheKey {
    pub source: String,
    pub resize: Option<ResizeOptions>,
    pub rotation: RotationOptions,
    pub decode: DecodeOptions,
    pub postprocessor: Option<PostprocessorKey>,
}

/// Key used by the memory caches and the disk cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    /// Encoded bytes of a source
    Encoded { uri: String },

    /// Decoded bitmap
    Bitmap(BitmapCacheKey),
}

impl CacheKey {
    pub fn encoded(uri: impl Into<String>) -> Self {
        Self::Encoded { uri: uri.into() }
    }

    /// Source uri the key was built from
    pub fn source_uri(&self) -> &str {
        match self {
            Self::Encoded { uri } => uri,
            Self::Bitmap(key) => &key.source,
        }
    }

    pub fn contains_uri(&self, uri: &str) -> bool {
        self.source_uri() == uri
    }

    /// Stable id used to name disk cache blobs
    pub fn resource_id(&self) -> String {
        let hash = match self {
            Self::Encoded { uri } => blake3::hash(uri.as_bytes()),
            Self::Bitmap(key) => blake3::hash(&serde_json::to_vec(key).unwrap_or_default()),
        };
        hash.to_hex().to_string()
    }
}

/// Builds cache keys for requests
pub trait CacheKeyFactory: Send + Sync {
    /// Key of the decoded bitmap, ignoring any postprocessor
    fn bitmap_cache_key(&self, request: &ImageRequest) -> CacheKey;

    /// Key of the postprocessed bitmap; equals the bitmap key when the
    /// request has no cacheable postprocessor
    fn postprocessed_bitmap_cache_key(&self, request: &ImageRequest) -> CacheKey;

    /// Key of the encoded bytes
    fn encoded_cache_key(&self, request: &ImageRequest) -> CacheKey;

    /// Normalize a source uri before it becomes part of a key
    fn cache_key_source_uri(&self, uri: &str) -> String {
        uri.to_string()
    }
}

/// Key factory using every request option that affects the output
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCacheKeyFactory;

impl DefaultCacheKeyFactory {
    fn bitmap_key(&self, request: &ImageRequest, postprocessor: Option<PostprocessorKey>) -> CacheKey {
        CacheKey::Bitmap(BitmapCacheKey {
            source: self.cache_key_source_uri(request.source_uri()),
            resize: request.resize_options(),
            rotation: request.rotation_options(),
            decode: request.decode_options(),
            postprocessor,
        })
    }
}

impl CacheKeyFactory for DefaultCacheKeyFactory {
    fn bitmap_cache_key(&self, request: &ImageRequest) -> CacheKey {
        self.bitmap_key(request, None)
    }

    fn postprocessed_bitmap_cache_key(&self, request: &ImageRequest) -> CacheKey {
        let postprocessor = request.postprocessor().and_then(|p| {
            p.cache_key().map(|key| PostprocessorKey {
                name: p.name().to_string(),
                key,
            })
        });
        self.bitmap_key(request, postprocessor)
    }

    fn encoded_cache_key(&self, request: &ImageRequest) -> CacheKey {
        CacheKey::encoded(self.cache_key_source_uri(request.source_uri()))
    }
}
