//! Encoded and decoded image values

use crate::error::{PipelineError, Result};
use crate::reference::CloseableRef;
use crate::request::BytesRange;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Container format of an encoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Bmp,
    Unknown,
}

impl From<image::ImageFormat> for ImageFormat {
    fn from(format: image::ImageFormat) -> Self {
        match format {
            image::ImageFormat::Jpeg => Self::Jpeg,
            image::ImageFormat::Png => Self::Png,
            image::ImageFormat::Gif => Self::Gif,
            image::ImageFormat::WebP => Self::WebP,
            image::ImageFormat::Bmp => Self::Bmp,
            _ => Self::Unknown,
        }
    }
}

impl ImageFormat {
    /// Sniff the format from the leading bytes of a payload
    pub fn detect(bytes: &[u8]) -> Self {
        image::guess_format(bytes)
            .map(Self::from)
            .unwrap_or(Self::Unknown)
    }
}

/// Header information parsed from an encoded payload without decoding it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetaData {
    pub format: ImageFormat,

    /// `None` when the header could not be read (e.g. truncated payload)
    pub width: Option<u32>,

    pub height: Option<u32>,
}

impl ImageMetaData {
    /// Parse format and dimensions from the payload header
    pub fn parse(bytes: &[u8]) -> Self {
        let format = ImageFormat::detect(bytes);
        let dimensions = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_dimensions().ok());
        Self {
            format,
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
        }
    }
}

/// Encoded image bytes plus parsed metadata.
///
/// Cloning shares the underlying byte buffer through its [`CloseableRef`].
#[derive(Debug, Clone)]
pub struct EncodedImage {
    bytes: CloseableRef<Vec<u8>>,
    metadata: Option<ImageMetaData>,
    bytes_range: Option<BytesRange>,
}

impl EncodedImage {
    pub fn new(bytes: CloseableRef<Vec<u8>>) -> Self {
        Self {
            bytes,
            metadata: None,
            bytes_range: None,
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::new(CloseableRef::of(bytes))
    }

    /// Copy metadata from another image onto this one
    #[must_use]
    pub fn with_metadata_from(mut self, other: &EncodedImage) -> Self {
        self.metadata = other.metadata;
        self.bytes_range = other.bytes_range;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: ImageMetaData) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_bytes_range(mut self, range: BytesRange) -> Self {
        self.bytes_range = Some(range);
        self
    }

    #[must_use]
    pub fn without_metadata(mut self) -> Self {
        self.metadata = None;
        self
    }

    pub fn bytes_ref(&self) -> &CloseableRef<Vec<u8>> {
        &self.bytes
    }

    pub fn into_bytes_ref(self) -> CloseableRef<Vec<u8>> {
        self.bytes
    }

    pub fn bytes(&self) -> Result<&[u8]> {
        self.bytes.get().map(Vec::as_slice)
    }

    pub fn size(&self) -> usize {
        self.bytes().map_or(0, <[u8]>::len)
    }

    pub fn is_valid(&self) -> bool {
        self.bytes.is_valid()
    }

    pub fn metadata(&self) -> Option<&ImageMetaData> {
        self.metadata.as_ref()
    }

    pub fn format(&self) -> ImageFormat {
        self.metadata
            .map(|m| m.format)
            .unwrap_or(ImageFormat::Unknown)
    }

    pub fn bytes_range(&self) -> Option<BytesRange> {
        self.bytes_range
    }
}

/// Quality of a decoded result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityInfo {
    /// Increasing number for successively better progressive results
    pub quality: u32,

    pub is_good_enough: bool,

    pub is_full_quality: bool,
}

impl QualityInfo {
    pub const FULL_QUALITY: QualityInfo = QualityInfo {
        quality: u32::MAX,
        is_good_enough: true,
        is_full_quality: true,
    };

    /// Quality of an intermediate progressive result
    pub fn partial(quality: u32) -> Self {
        Self {
            quality,
            is_good_enough: false,
            is_full_quality: false,
        }
    }
}

/// Decoded RGBA bitmap
#[derive(Debug, Clone)]
pub struct DecodedImage {
    bitmap: image::RgbaImage,
    quality: QualityInfo,
    metadata: Option<ImageMetaData>,
}

/// Decoded bitmap shared through the bitmap caches
pub type BitmapRef = CloseableRef<DecodedImage>;

impl DecodedImage {
    pub fn new(bitmap: image::RgbaImage, quality: QualityInfo) -> Self {
        Self {
            bitmap,
            quality,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Option<ImageMetaData>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_bitmap(mut self, bitmap: image::RgbaImage) -> Self {
        self.bitmap = bitmap;
        self
    }

    pub fn bitmap(&self) -> &image::RgbaImage {
        &self.bitmap
    }

    pub fn width(&self) -> u32 {
        self.bitmap.width()
    }

    pub fn height(&self) -> u32 {
        self.bitmap.height()
    }

    pub fn quality(&self) -> QualityInfo {
        self.quality
    }

    pub fn metadata(&self) -> Option<&ImageMetaData> {
        self.metadata.as_ref()
    }

    /// Bytes held by the RGBA pixel buffer
    pub fn size_in_bytes(&self) -> usize {
        self.bitmap.as_raw().len()
    }

    /// Encode the bitmap as PNG
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.bitmap
            .write_to(&mut out, image::ImageFormat::Png)
            .map_err(|e| PipelineError::decode("png-encode", e))?;
        Ok(out.into_inner())
    }
}
