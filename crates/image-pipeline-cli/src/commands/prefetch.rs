//! Warm the caches without returning images

use crate::parser::parse_size;
use anyhow::{Context as _, Result};
use clap::{Args, ValueEnum};
use image_pipeline_core::request::ResizeOptions;
use image_pipeline_core::ImageRequestBuilder;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PrefetchTarget {
    /// Encoded memory cache and disk cache
    Disk,

    /// Decoded bitmap memory cache
    Bitmap,
}

#[derive(Args)]
pub struct PrefetchCommand {
    /// Image uris to prefetch
    #[arg(value_name = "URI", required = true)]
    uris: Vec<String>,

    /// Cache level to fill
    #[arg(long, value_enum, default_value = "disk")]
    to: PrefetchTarget,

    /// Size the bitmap will be requested at (bitmap prefetch only)
    #[arg(long, value_parser = parse_size)]
    resize: Option<ResizeOptions>,

    /// Give up on a prefetch after this many seconds
    #[arg(long, default_value = "60")]
    timeout: u64,
}

impl PrefetchCommand {
    pub async fn execute(self, config: Option<&Path>) -> Result<()> {
        let pipeline = super::load_pipeline(config).await?;
        let start = Instant::now();

        let mut fetches = Vec::with_capacity(self.uris.len());
        for uri in &self.uris {
            let mut builder = ImageRequestBuilder::new(uri.as_str());
            if let Some(resize) = self.resize {
                builder = builder.with_resize_options(resize);
            }
            let request = builder.build().context("Invalid request")?;
            let fetch = match self.to {
                PrefetchTarget::Disk => pipeline.prefetch_to_disk_cache(request)?,
                PrefetchTarget::Bitmap => pipeline.prefetch_to_bitmap_cache(request)?,
            };
            fetches.push((uri, fetch));
        }

        let mut failed = 0usize;
        for (uri, fetch) in fetches {
            match fetch.result_within(Duration::from_secs(self.timeout)).await {
                Ok(_) => info!("Prefetched {}", uri),
                Err(error) => {
                    failed += 1;
                    warn!("Prefetch of {} failed: {}", uri, error);
                }
            }
        }

        println!(
            "Prefetched {}/{} images in {:.3}s",
            self.uris.len() - failed,
            self.uris.len(),
            start.elapsed().as_secs_f64()
        );
        if failed > 0 {
            anyhow::bail!("{failed} prefetch(es) failed");
        }
        Ok(())
    }
}
