//! Cache statistics

use anyhow::{Context as _, Result};
use clap::Args;
use image_pipeline_core::ImageRequest;
use serde_json::json;
use std::path::Path;

#[derive(Args)]
pub struct StatsCommand {
    /// Fetch these uris first so the memory caches have something to show
    #[arg(value_name = "URI")]
    uris: Vec<String>,

    /// Remove every cached entry after printing
    #[arg(long)]
    clear: bool,
}

impl StatsCommand {
    pub async fn execute(self, config: Option<&Path>) -> Result<()> {
        let pipeline = super::load_pipeline(config).await?;

        for uri in &self.uris {
            let request = ImageRequest::from_uri(uri.as_str()).context("Invalid request")?;
            pipeline
                .fetch_decoded_image(request)?
                .result()
                .await
                .with_context(|| format!("Failed to fetch {uri}"))?;
        }

        let disk_bytes = pipeline
            .disk_cache()
            .size_bytes()
            .await
            .context("Failed to read disk cache size")?;
        let report = json!({
            "caches": pipeline.stats(),
            "disk_cache_bytes": disk_bytes,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);

        if self.clear {
            pipeline.clear_caches().await.context("Failed to clear caches")?;
            println!("Cleared all caches");
        }
        Ok(())
    }
}
