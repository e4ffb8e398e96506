//! Fetch images through the pipeline and report where each came from

use crate::parser::{parse_rotation, parse_size};
use anyhow::{Context as _, Result};
use clap::Args;
use image_pipeline_core::postprocess::{BlurPostprocessor, GrayscalePostprocessor};
use image_pipeline_core::request::{ResizeOptions, RotationOptions};
use image_pipeline_core::{FetchEvent, ImagePipeline, ImageRequest, ImageRequestBuilder};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Args)]
pub struct FetchCommand {
    /// Image uris (http(s)://, file:// or plain paths)
    #[arg(value_name = "URI", required = true)]
    uris: Vec<String>,

    /// Fit decoded images into WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    resize: Option<ResizeOptions>,

    /// Rotate decoded images clockwise by 0, 90, 180 or 270 degrees
    #[arg(long, value_parser = parse_rotation)]
    rotate: Option<RotationOptions>,

    /// Convert decoded images to grayscale
    #[arg(long)]
    grayscale: bool,

    /// Blur decoded images with this sigma
    #[arg(long, conflicts_with = "grayscale")]
    blur: Option<f32>,

    /// Fetch the encoded bytes instead of decoding
    #[arg(long)]
    encoded: bool,

    /// Deliver intermediate results while downloading
    #[arg(long)]
    progressive: bool,

    /// Skip the disk cache
    #[arg(long)]
    no_disk_cache: bool,

    /// Fetch every uri this many times (later rounds hit the caches)
    #[arg(long, default_value = "1")]
    repeat: usize,

    /// Give up on a request after this many seconds
    #[arg(long, default_value = "60")]
    timeout: u64,

    /// Write results into this directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl FetchCommand {
    pub async fn execute(self, config: Option<&Path>) -> Result<()> {
        let pipeline = super::load_pipeline(config).await?;
        if let Some(output) = &self.output {
            std::fs::create_dir_all(output).context("Failed to create output directory")?;
        }

        for round in 0..self.repeat.max(1) {
            for (index, uri) in self.uris.iter().enumerate() {
                let request = self.request(uri)?;
                let start = Instant::now();
                let mut report = if self.encoded {
                    self.fetch_encoded(&pipeline, request, index).await
                } else {
                    self.fetch_decoded(&pipeline, request, index).await
                }
                .with_context(|| format!("Failed to fetch {uri}"))?;

                report["uri"] = json!(uri);
                report["round"] = json!(round);
                report["elapsed_ms"] = json!(start.elapsed().as_millis());
                println!("{}", serde_json::to_string(&report)?);
            }
        }
        Ok(())
    }

    fn request(&self, uri: &str) -> Result<ImageRequest> {
        let mut builder = ImageRequestBuilder::new(uri)
            .with_progressive_rendering(self.progressive)
            .with_disk_cache(!self.no_disk_cache);
        if let Some(resize) = self.resize {
            builder = builder.with_resize_options(resize);
        }
        if let Some(rotation) = self.rotate {
            builder = builder.with_rotation_options(rotation);
        }
        if self.grayscale {
            builder = builder.with_postprocessor(Arc::new(GrayscalePostprocessor));
        } else if let Some(sigma) = self.blur {
            builder = builder.with_postprocessor(Arc::new(BlurPostprocessor::new(sigma)));
        }
        builder.build().context("Invalid request")
    }

    async fn fetch_decoded(
        &self,
        pipeline: &ImagePipeline,
        request: ImageRequest,
        index: usize,
    ) -> Result<serde_json::Value> {
        let uri = request.source_uri().to_string();
        let mut fetch = pipeline.fetch_decoded_image(request)?;
        let context = Arc::clone(fetch.context());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.timeout);

        let mut intermediates = 0usize;
        let bitmap = loop {
            let event = match tokio::time::timeout_at(deadline, fetch.next_event()).await {
                Ok(Some(event)) => event,
                Ok(None) => anyhow::bail!("Request ended without a result"),
                Err(_) => {
                    fetch.cancel();
                    anyhow::bail!("Timed out after {}s", self.timeout);
                }
            };
            match event {
                FetchEvent::Progress(progress) => debug!(uri = %uri, progress, "Progress"),
                FetchEvent::Intermediate(_) => intermediates += 1,
                FetchEvent::Final(Some(bitmap)) => break bitmap,
                FetchEvent::Final(None) => anyhow::bail!("No image available"),
                FetchEvent::Failure(error) => return Err(error.into()),
                FetchEvent::Cancelled => anyhow::bail!("Request was cancelled"),
            }
        };

        let image = bitmap.get()?;
        let mut report = json!({
            "width": image.width(),
            "height": image.height(),
            "intermediates": intermediates,
            "extras": context.extras(),
        });
        if let Some(output) = &self.output {
            let path = output.join(output_name(&uri, index, "png"));
            std::fs::write(&path, image.to_png()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {}", path.display());
            report["output"] = json!(path.display().to_string());
        }
        Ok(report)
    }

    async fn fetch_encoded(
        &self,
        pipeline: &ImagePipeline,
        request: ImageRequest,
        index: usize,
    ) -> Result<serde_json::Value> {
        let uri = request.source_uri().to_string();
        let fetch = pipeline.fetch_encoded_image(request)?;
        let context = Arc::clone(fetch.context());
        let bytes = fetch
            .result_within(Duration::from_secs(self.timeout))
            .await?
            .context("No image available")?;

        let data = bytes.get()?;
        let mut report = json!({
            "bytes": data.len(),
            "extras": context.extras(),
        });
        if let Some(output) = &self.output {
            let path = output.join(output_name(&uri, index, "bin"));
            std::fs::write(&path, data.as_slice())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {}", path.display());
            report["output"] = json!(path.display().to_string());
        }
        Ok(report)
    }
}

/// File name for the `index`th uri: its last path segment with a new
/// extension, or `image-<index>` if it has none
fn output_name(uri: &str, index: usize, extension: &str) -> String {
    let stem = uri
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.split(['?', '#']).next())
        .map(|segment| segment.split('.').next().unwrap_or(segment))
        .filter(|stem| !stem.is_empty() && !stem.contains(':'))
        .map_or_else(|| format!("image-{index}"), str::to_string);
    format!("{stem}.{extension}")
}
