//! Image requests and their options

use crate::error::{PipelineError, Result};
use crate::postprocess::Postprocessor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How far down the pipeline a request may go.
///
/// Levels are ordered from most to least expensive: a request whose lowest
/// permitted level is `DiskCache` may be served from any memory cache or
/// the disk cache, but never from the network.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestLevel {
    /// Fetch from the network or local storage if needed
    #[default]
    FullFetch = 1,

    /// Disk cache lookup at most
    DiskCache = 2,

    /// Encoded memory cache lookup at most
    EncodedMemoryCache = 3,

    /// Bitmap memory cache lookup only
    BitmapMemoryCache = 4,
}

impl RequestLevel {
    pub fn max(a: RequestLevel, b: RequestLevel) -> RequestLevel {
        std::cmp::max(a, b)
    }
}

/// Scheduling priority of a request
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn higher(a: Priority, b: Priority) -> Priority {
        std::cmp::max(a, b)
    }
}

/// Target box for downscaling a decoded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResizeOptions {
    pub width: u32,
    pub height: u32,
}

impl ResizeOptions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Square target box
    pub fn for_square_size(size: u32) -> Self {
        Self::new(size, size)
    }
}

/// Clockwise rotation applied after decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RotationOptions {
    degrees: u16,
}

impl RotationOptions {
    pub fn no_rotation() -> Self {
        Self { degrees: 0 }
    }

    /// Force a rotation; only multiples of 90 are accepted
    pub fn force_rotation(degrees: u16) -> Result<Self> {
        if degrees % 90 != 0 {
            return Err(PipelineError::InvalidRequest(format!(
                "rotation must be a multiple of 90, got {degrees}"
            )));
        }
        Ok(Self {
            degrees: degrees % 360,
        })
    }

    pub fn degrees(&self) -> u16 {
        self.degrees
    }

    pub fn rotation_enabled(&self) -> bool {
        self.degrees != 0
    }
}

/// Options controlling how encoded bytes are decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Decode intermediate (progressive) results as preview frames
    pub decode_preview_frame: bool,

    /// Downsample during decode so neither side exceeds this many pixels
    pub max_decode_dimension: Option<u32>,
}

/// Inclusive byte range of an encoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BytesRange {
    pub from: u64,

    /// Last byte, inclusive; `None` means up to the end of the content
    pub to: Option<u64>,
}

impl BytesRange {
    pub fn from_offset(from: u64) -> Self {
        Self { from, to: None }
    }

    pub fn up_to(to: u64) -> Self {
        Self { from: 0, to: Some(to) }
    }

    pub fn between(from: u64, to: u64) -> Self {
        Self { from, to: Some(to) }
    }

    /// Whether this range fully covers `other`
    pub fn contains(&self, other: &BytesRange) -> bool {
        if other.from < self.from {
            return false;
        }
        match (self.to, other.to) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => theirs <= mine,
        }
    }

    /// Value for an HTTP `Range` request header
    pub fn to_http_range_header(&self) -> String {
        match self.to {
            Some(to) => format!("bytes={}-{}", self.from, to),
            None => format!("bytes={}-", self.from),
        }
    }

    /// Parse an HTTP `Content-Range` response header such as
    /// `bytes 0-99/2000`
    pub fn from_content_range_header(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes")?.trim();
        let (range, _total) = spec.split_once('/')?;
        let (from, to) = range.split_once('-')?;
        Some(Self {
            from: from.trim().parse().ok()?,
            to: Some(to.trim().parse().ok()?),
        })
    }

    /// Total content length announced by a `Content-Range` header
    pub fn total_from_content_range_header(header: &str) -> Option<u64> {
        header.rsplit_once('/')?.1.trim().parse().ok()
    }
}

impl fmt::Display for BytesRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to {
            Some(to) => write!(f, "{}-{}", self.from, to),
            None => write!(f, "{}-", self.from),
        }
    }
}

/// Immutable description of an image to load
#[derive(Clone)]
pub struct ImageRequest {
    source_uri: String,
    resize_options: Option<ResizeOptions>,
    rotation_options: RotationOptions,
    decode_options: DecodeOptions,
    bytes_range: Option<BytesRange>,
    priority: Priority,
    lowest_permitted_level: RequestLevel,
    progressive_rendering_enabled: bool,
    disk_cache_enabled: bool,
    memory_cache_enabled: bool,
    postprocessor: Option<Arc<dyn Postprocessor>>,
}

impl ImageRequest {
    /// Request with default options for `uri`
    pub fn from_uri(uri: impl Into<String>) -> Result<Self> {
        ImageRequestBuilder::new(uri).build()
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    /// Whether the source must be fetched over HTTP(S)
    pub fn is_network_uri(&self) -> bool {
        let uri = self.source_uri.to_ascii_lowercase();
        uri.starts_with("http://") || uri.starts_with("https://")
    }

    pub fn resize_options(&self) -> Option<ResizeOptions> {
        self.resize_options
    }

    pub fn rotation_options(&self) -> RotationOptions {
        self.rotation_options
    }

    pub fn decode_options(&self) -> DecodeOptions {
        self.decode_options
    }

    pub fn bytes_range(&self) -> Option<BytesRange> {
        self.bytes_range
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn lowest_permitted_level(&self) -> RequestLevel {
        self.lowest_permitted_level
    }

    pub fn progressive_rendering_enabled(&self) -> bool {
        self.progressive_rendering_enabled
    }

    pub fn disk_cache_enabled(&self) -> bool {
        self.disk_cache_enabled
    }

    pub fn memory_cache_enabled(&self) -> bool {
        self.memory_cache_enabled
    }

    pub fn postprocessor(&self) -> Option<&Arc<dyn Postprocessor>> {
        self.postprocessor.as_ref()
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("source_uri", &self.source_uri)
            .field("resize_options", &self.resize_options)
            .field("rotation_options", &self.rotation_options)
            .field("decode_options", &self.decode_options)
            .field("bytes_range", &self.bytes_range)
            .field("priority", &self.priority)
            .field("lowest_permitted_level", &self.lowest_permitted_level)
            .field(
                "postprocessor",
                &self.postprocessor.as_ref().map(|p| p.name().to_string()),
            )
            .finish()
    }
}

/// Builder for [`ImageRequest`]
#[derive(Clone)]
pub struct ImageRequestBuilder {
    request: ImageRequest,
}

impl ImageRequestBuilder {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            request: ImageRequest {
                source_uri: uri.into(),
                resize_options: None,
                rotation_options: RotationOptions::no_rotation(),
                decode_options: DecodeOptions::default(),
                bytes_range: None,
                priority: Priority::Medium,
                lowest_permitted_level: RequestLevel::FullFetch,
                progressive_rendering_enabled: false,
                disk_cache_enabled: true,
                memory_cache_enabled: true,
                postprocessor: None,
            },
        }
    }

    /// Start from an existing request
    pub fn from_request(request: &ImageRequest) -> Self {
        Self {
            request: request.clone(),
        }
    }

    pub fn with_resize_options(mut self, resize: ResizeOptions) -> Self {
        self.request.resize_options = Some(resize);
        self
    }

    pub fn with_rotation_options(mut self, rotation: RotationOptions) -> Self {
        self.request.rotation_options = rotation;
        self
    }

    pub fn with_decode_options(mut self, options: DecodeOptions) -> Self {
        self.request.decode_options = options;
        self
    }

    pub fn with_bytes_range(mut self, range: BytesRange) -> Self {
        self.request.bytes_range = Some(range);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.request.priority = priority;
        self
    }

    pub fn with_lowest_permitted_level(mut self, level: RequestLevel) -> Self {
        self.request.lowest_permitted_level = level;
        self
    }

    pub fn with_progressive_rendering(mut self, enabled: bool) -> Self {
        self.request.progressive_rendering_enabled = enabled;
        self
    }

    pub fn with_disk_cache(mut self, enabled: bool) -> Self {
        self.request.disk_cache_enabled = enabled;
        self
    }

    pub fn with_memory_cache(mut self, enabled: bool) -> Self {
        self.request.memory_cache_enabled = enabled;
        self
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.request.postprocessor = Some(postprocessor);
        self
    }

    pub fn build(self) -> Result<ImageRequest> {
        let request = self.request;
        if request.source_uri.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "source uri must not be empty".to_string(),
            ));
        }
        if request.lowest_permitted_level == RequestLevel::DiskCache && !request.disk_cache_enabled
        {
            return Err(PipelineError::InvalidRequest(
                "disk cache is disabled but is the lowest permitted level".to_string(),
            ));
        }
        if let Some(resize) = request.resize_options {
            if resize.width == 0 || resize.height == 0 {
                return Err(PipelineError::InvalidRequest(format!(
                    "resize target must be non-empty, got {}x{}",
                    resize.width, resize.height
                )));
            }
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_levels_are_ordered() {
        assert!(RequestLevel::FullFetch < RequestLevel::DiskCache);
        assert!(RequestLevel::EncodedMemoryCache < RequestLevel::BitmapMemoryCache);
        assert_eq!(
            RequestLevel::max(RequestLevel::DiskCache, RequestLevel::FullFetch),
            RequestLevel::DiskCache
        );
    }

    #[test]
    fn test_bytes_range_headers() {
        assert_eq!(BytesRange::between(0, 99).to_http_range_header(), "bytes=0-99");
        assert_eq!(BytesRange::from_offset(100).to_http_range_header(), "bytes=100-");

        let parsed = BytesRange::from_content_range_header("bytes 0-99/2000").unwrap();
        assert_eq!(parsed, BytesRange::between(0, 99));
        assert_eq!(
            BytesRange::total_from_content_range_header("bytes 0-99/2000"),
            Some(2000)
        );
        assert!(BytesRange::from_content_range_header("garbage").is_none());
    }

    #[test]
    fn test_bytes_range_contains() {
        let open = BytesRange::from_offset(10);
        assert!(open.contains(&BytesRange::between(20, 30)));
        assert!(!open.contains(&BytesRange::up_to(5)));
        assert!(!BytesRange::between(0, 10).contains(&BytesRange::from_offset(0)));
    }

    #[test]
    fn test_builder_validation() {
        assert!(ImageRequest::from_uri("").is_err());
        assert!(ImageRequestBuilder::new("https://example.com/a.png")
            .with_disk_cache(false)
            .with_lowest_permitted_level(RequestLevel::DiskCache)
            .build()
            .is_err());
        assert!(RotationOptions::force_rotation(45).is_err());
        assert_eq!(RotationOptions::force_rotation(450).unwrap().degrees(), 90);
    }

    #[test]
    fn test_network_uri_detection() {
        assert!(ImageRequest::from_uri("HTTPS://example.com/a.jpg")
            .unwrap()
            .is_network_uri());
        assert!(!ImageRequest::from_uri("file:///tmp/a.jpg")
            .unwrap()
            .is_network_uri());
    }
}
