//! Error types for the image pipeline

use thiserror::Error;

/// Errors raised by pipeline stages, caches and collaborators.
///
/// The type is `Clone` so that a single upstream failure can be fanned out
/// to every consumer attached to a multiplexed request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Fetch failed in {stage}: {message}")]
    Fetch { stage: String, message: String },

    #[error("Decode failed in {stage}: {message}")]
    Decode { stage: String, message: String },

    #[error("Use of released reference: {0}")]
    UseAfterRelease(String),

    #[error("Cache consistency violated: {0}")]
    CacheConsistency(String),

    #[error("Postprocessor '{name}' failed: {message}")]
    Postprocess { name: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Executor unavailable: {0}")]
    Executor(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Request {0} was cancelled")]
    Cancelled(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Network or disk fetch failure raised by `stage`
    pub fn fetch(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Fetch {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    /// Malformed or unsupported payload rejected by `stage`
    pub fn decode(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    /// Tag the error with the stage that raised it.
    ///
    /// Errors that already name a stage are returned unchanged.
    #[must_use]
    pub fn with_stage(self, stage: impl Into<String>) -> Self {
        if self.stage().is_some() {
            return self;
        }
        Self::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Stage that raised the error, if known
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Fetch { stage, .. } | Self::Decode { stage, .. } | Self::Stage { stage, .. } => {
                Some(stage)
            }
            _ => None,
        }
    }

    /// The innermost error with stage wrappers removed
    #[must_use]
    pub fn root(&self) -> &PipelineError {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        Self::decode("image", err)
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// Tests
// ============================================================================
