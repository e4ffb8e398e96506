//! Postprocessors applied to decoded images

use crate::error::Result;
use crate::image_data::DecodedImage;

/// Transformation applied to a decoded image before delivery.
///
/// A postprocessor with a cache key has its output cached separately from
/// the plain decoded bitmap.
pub trait Postprocessor: Send + Sync {
    /// Name used in cache keys and diagnostics
    fn name(&self) -> &str;

    /// Stable key identifying this postprocessor's output, if cacheable
    fn cache_key(&self) -> Option<String> {
        None
    }

    /// Whether intermediate results should also be postprocessed and
    /// delivered
    fn is_repeated(&self) -> bool {
        false
    }

    fn process(&self, source: &DecodedImage) -> Result<DecodedImage>;
}

/// Gaussian blur
#[derive(Debug, Clone)]
pub struct BlurPostprocessor {
    sigma: f32,
}

impl BlurPostprocessor {
    pub fn new(sigma: f32) -> Self {
        Self { sigma }
    }
}

impl Postprocessor for BlurPostprocessor {
    fn name(&self) -> &str {
        "blur"
    }

    fn cache_key(&self) -> Option<String> {
        Some(format!("blur:{:.2}", self.sigma))
    }

    fn process(&self, source: &DecodedImage) -> Result<DecodedImage> {
        let blurred = image::imageops::blur(source.bitmap(), self.sigma);
        Ok(source.clone().with_bitmap(blurred))
    }
}

/// Luminance-only copy of the image, alpha preserved
#[derive(Debug, Clone, Default)]
pub struct GrayscalePostprocessor;

impl Postprocessor for GrayscalePostprocessor {
    fn name(&self) -> &str {
        "grayscale"
    }

    fn cache_key(&self) -> Option<String> {
        Some("grayscale".to_string())
    }

    fn process(&self, source: &DecodedImage) -> Result<DecodedImage> {
        let mut bitmap = source.bitmap().clone();
        for pixel in bitmap.pixels_mut() {
            let [r, g, b, a] = pixel.0;
            let luma = (0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b))
                .round()
                .clamp(0.0, 255.0) as u8;
            pixel.0 = [luma, luma, luma, a];
        }
        Ok(source.clone().with_bitmap(bitmap))
    }
}
