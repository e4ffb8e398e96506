//! Pipeline configuration
//!
//! Every section has defaults, so a YAML file only needs the values it
//! overrides:
//!
//! ```yaml
//! bitmap_cache:
//!   max_cache_size: 134217728
//!   eviction_policy: insertion_order
//! disk_cache:
//!   directory: /var/cache/imagepipe
//!   max_size_bytes: 268435456
//! network:
//!   timeout_secs: 10
//! ```

use crate::cache::MemoryCacheParams;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the default disk cache directory
pub const CACHE_DIR_ENV: &str = "IMAGE_PIPELINE_CACHE_DIR";

/// Disk cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Directory for cached blobs; `None` keeps the disk cache in memory
    pub directory: Option<PathBuf>,

    /// Size limit before least recently used blobs are removed
    pub max_size_bytes: u64,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            directory: std::env::var(CACHE_DIR_ENV).ok().map(PathBuf::from),
            max_size_bytes: 40 * 1024 * 1024,
        }
    }
}

/// Fetch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Whole-request timeout for HTTP fetches
    pub timeout_secs: u64,

    pub user_agent: String,

    /// Minimum spacing between intermediate results of a progressive fetch
    pub partial_result_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: format!("imagepipe/{}", env!("CARGO_PKG_VERSION")),
            partial_result_interval_ms: 100,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub bitmap_cache: MemoryCacheParams,

    #[serde(default = "MemoryCacheParams::encoded_defaults")]
    pub encoded_cache: MemoryCacheParams,

    pub disk_cache: DiskCacheConfig,

    pub network: NetworkConfig,

    /// Install a request listener that logs timings through `tracing`
    pub log_requests: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bitmap_cache: MemoryCacheParams::bitmap_defaults(),
            encoded_cache: MemoryCacheParams::encoded_defaults(),
            disk_cache: DiskCacheConfig::default(),
            network: NetworkConfig::default(),
            log_requests: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn with_bitmap_cache(mut self, params: MemoryCacheParams) -> Self {
        self.bitmap_cache = params;
        self
    }

    pub fn with_encoded_cache(mut self, params: MemoryCacheParams) -> Self {
        self.encoded_cache = params;
        self
    }

    pub fn with_disk_cache(mut self, disk_cache: DiskCacheConfig) -> Self {
        self.disk_cache = disk_cache;
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.log_requests = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, params) in [
            ("bitmap_cache", &self.bitmap_cache),
            ("encoded_cache", &self.encoded_cache),
        ] {
            if params.max_cache_entry_size > params.max_cache_size {
                return Err(PipelineError::Config(format!(
                    "{name}: max_cache_entry_size exceeds max_cache_size"
                )));
            }
        }
        if self.network.timeout_secs == 0 {
            return Err(PipelineError::Config(
                "network.timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictionPolicy;

    #[test]
    fn test_yaml_overrides_only_given_fields() {
        let config = PipelineConfig::from_yaml_str(
            "bitmap_cache:\n  max_cache_size: 1000\n  max_cache_entry_size: 500\n  eviction_policy: insertion_order\nnetwork:\n  timeout_secs: 5\n",
        )
        .unwrap();

        assert_eq!(config.bitmap_cache.max_cache_size, 1000);
        assert_eq!(
            config.bitmap_cache.eviction_policy,
            EvictionPolicy::InsertionOrder
        );
        assert_eq!(config.encoded_cache, MemoryCacheParams::encoded_defaults());
        assert_eq!(config.network.timeout_secs, 5);
        assert_eq!(config.network.partial_result_interval_ms, 100);
    }

    #[test]
    fn test_validation_rejects_bad_limits() {
        let err = PipelineConfig::from_yaml_str("network:\n  timeout_secs: 0\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let err = PipelineConfig::from_yaml_str(
            "bitmap_cache:\n  max_cache_size: 10\n  max_cache_entry_size: 20\n",
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "log_requests: true\n").unwrap();
        assert!(PipelineConfig::from_yaml_file(&path).unwrap().log_requests);
        assert!(PipelineConfig::from_yaml_file(dir.path().join("missing.yaml")).is_err());
    }
}
