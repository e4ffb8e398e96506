//! Image Pipeline Core - staged image loading with multi-level caching
//!
//! This crate provides the building blocks of an asynchronous image pipeline:
//! counted ownership references, a reference-counted eviction cache, a
//! push-based producer/consumer protocol, the concrete pipeline stages, and
//! the [`ImagePipeline`] orchestrator that chains them per request.

pub mod cache;
pub mod config;
pub mod consumer;
pub mod context;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod image_data;
pub mod listener;
pub mod pipeline;
pub mod postprocess;
pub mod producer;
pub mod producers;
pub mod reference;
pub mod request;
pub mod sequence;
pub mod storage;

pub use cache::{
    BitmapMemoryCache, CacheKey, CacheKeyFactory, CountingMemoryCache, DefaultCacheKeyFactory,
    DiskStorageCache, EncodedMemoryCache, EvictionPolicy, MemoryCacheParams, MemoryCacheStats,
};
pub use config::PipelineConfig;
pub use consumer::{Consumer, DelegatingConsumer, ResultStatus, SharedConsumer};
pub use context::RequestContext;
pub use decoder::{ImageCrateDecoder, ImageDecoder};
pub use error::{PipelineError, Result};
pub use executor::{ExecutorSupplier, JobScheduler};
pub use fetch::{CompositeFetcher, NetworkFetcher};
pub use image_data::{BitmapRef, DecodedImage, EncodedImage, ImageFormat, QualityInfo};
pub use listener::{RequestListener, TracingRequestListener};
pub use pipeline::{FetchEvent, ImageFetch, ImagePipeline, ImagePipelineBuilder, PipelineStats};
pub use postprocess::Postprocessor;
pub use producer::{Producer, SharedProducer};
pub use reference::CloseableRef;
pub use request::{ImageRequest, ImageRequestBuilder, Priority, RequestLevel};
pub use sequence::ProducerSequenceFactory;
pub use storage::{BlobStore, FileBlobStore, InMemoryBlobStore};
