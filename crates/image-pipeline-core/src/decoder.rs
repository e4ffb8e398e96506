//! Decoding encoded payloads into RGBA bitmaps

use crate::error::{PipelineError, Result};
use crate::image_data::{DecodedImage, EncodedImage, QualityInfo};
use crate::request::DecodeOptions;
use image::imageops::FilterType;

/// Opaque codec turning encoded bytes into a bitmap
pub trait ImageDecoder: Send + Sync {
    /// Decode the first `length` bytes of `encoded`
    fn decode(
        &self,
        encoded: &EncodedImage,
        length: usize,
        quality: QualityInfo,
        options: &DecodeOptions,
    ) -> Result<DecodedImage>;
}

/// Decoder backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(
        &self,
        encoded: &EncodedImage,
        length: usize,
        quality: QualityInfo,
        options: &DecodeOptions,
    ) -> Result<DecodedImage> {
        let bytes = encoded.bytes()?;
        let bytes = &bytes[..length.min(bytes.len())];
        if bytes.is_empty() {
            return Err(PipelineError::decode("ImageCrateDecoder", "empty payload"));
        }

        let decoded = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::decode("ImageCrateDecoder", e))?;
        let decoded = match options.max_decode_dimension {
            Some(max) if max > 0 && (decoded.width() > max || decoded.height() > max) => {
                decoded.resize(max, max, FilterType::Triangle)
            }
            _ => decoded,
        };

        Ok(DecodedImage::new(decoded.to_rgba8(), quality).with_metadata(encoded.metadata().copied()))
    }
}
