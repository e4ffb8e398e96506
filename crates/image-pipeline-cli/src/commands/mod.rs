//! Subcommands of `imagepipe`

pub mod fetch;
pub mod prefetch;
pub mod stats;

use anyhow::{Context as _, Result};
use image_pipeline_core::{ImagePipeline, PipelineConfig};
use std::path::Path;
use tracing::debug;

/// Load the config file if one was given and build a pipeline from it
pub async fn load_pipeline(config: Option<&Path>) -> Result<ImagePipeline> {
    let config = match config {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    debug!("Using config: {:?}", config);
    ImagePipeline::from_config(config)
        .await
        .context("Failed to create image pipeline")
}
