//! Pipeline entry point
//!
//! [`ImagePipeline`] owns the caches and the [`ProducerSequenceFactory`],
//! creates a [`RequestContext`] per call and hands results back through an
//! [`ImageFetch`]: a channel-backed handle that yields [`FetchEvent`]s and
//! cancels the request when dropped unfinished.

use crate::cache::{
    bitmap_memory_cache, encoded_memory_cache, BitmapMemoryCache, CacheKeyFactory,
    DefaultCacheKeyFactory, DiskCacheStats, DiskStorageCache, EncodedMemoryCache,
    MemoryCacheStats,
};
use crate::config::PipelineConfig;
use crate::consumer::{BaseConsumer, Consumer, ResultStatus};
use crate::context::RequestContext;
use crate::decoder::{ImageCrateDecoder, ImageDecoder};
use crate::error::{PipelineError, Result};
use crate::executor::ExecutorSupplier;
use crate::fetch::{CompositeFetcher, NetworkFetcher};
use crate::image_data::BitmapRef;
use crate::listener::{
    ForwardingRequestListener, NoopRequestListener, RequestListener, TracingRequestListener,
};
use crate::producer::SharedProducer;
use crate::reference::CloseableRef;
use crate::request::ImageRequest;
use crate::sequence::ProducerSequenceFactory;
use crate::storage::{BlobStore, FileBlobStore, InMemoryBlobStore};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

// ============================================================================
// Fetch handle
// ============================================================================

/// One event observed on an [`ImageFetch`]
#[derive(Debug)]
pub enum FetchEvent<T> {
    Progress(f32),

    /// Non-final result; later events supersede it
    Intermediate(T),

    /// Terminal result. `None` when the lowest permitted level was reached
    /// without a value.
    Final(Option<T>),

    Failure(PipelineError),

    Cancelled,
}

impl<T> FetchEvent<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final(_) | Self::Failure(_) | Self::Cancelled)
    }
}

/// Handle to a submitted request
pub struct ImageFetch<T> {
    context: Arc<RequestContext>,
    events: mpsc::UnboundedReceiver<FetchEvent<T>>,
    finished: bool,
}

impl<T> ImageFetch<T> {
    pub fn id(&self) -> &str {
        self.context.id()
    }

    pub fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    /// Whether the terminal event has been observed
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next event, or `None` once the terminal event was returned
    pub async fn next_event(&mut self) -> Option<FetchEvent<T>> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        if event.as_ref().map_or(true, FetchEvent::is_terminal) {
            self.finished = true;
        }
        event
    }

    /// Drive the fetch to its terminal event
    pub async fn result(mut self) -> Result<Option<T>> {
        while let Some(event) = self.next_event().await {
            match event {
                FetchEvent::Final(result) => return Ok(result),
                FetchEvent::Failure(error) => return Err(error),
                FetchEvent::Cancelled => {
                    return Err(PipelineError::Cancelled(self.context.id().to_string()))
                }
                FetchEvent::Progress(_) | FetchEvent::Intermediate(_) => {}
            }
        }
        Err(PipelineError::CacheConsistency(format!(
            "request {} ended without a terminal event",
            self.context.id()
        )))
    }

    /// Like [`result`](Self::result), giving up and cancelling after `timeout`
    pub async fn result_within(self, timeout: Duration) -> Result<Option<T>> {
        let context = Arc::clone(&self.context);
        match tokio::time::timeout(timeout, self.result()).await {
            Ok(result) => result,
            Err(_) => {
                context.cancel();
                Err(PipelineError::Cancelled(context.id().to_string()))
            }
        }
    }

    pub fn cancel(&self) {
        self.context.cancel();
    }

    /// Let the request run to completion without observing it
    pub fn detach(mut self) {
        self.finished = true;
    }
}

impl<T> Drop for ImageFetch<T> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(request_id = %self.context.id(), "Fetch dropped before completion");
            self.context.cancel();
        }
    }
}

/// Terminal consumer of every request: reports to the listener and feeds
/// the fetch channel
struct FetchConsumer<T> {
    context: Arc<RequestContext>,
    sender: mpsc::UnboundedSender<FetchEvent<T>>,
}

impl<T: Send> Consumer<T> for FetchConsumer<T> {
    fn on_new_result(&self, result: Option<T>, status: ResultStatus) {
        if status.is_last() {
            self.context.listener().on_request_success(&self.context);
            let _ = self.sender.send(FetchEvent::Final(result));
        } else if let Some(result) = result {
            let _ = self.sender.send(FetchEvent::Intermediate(result));
        }
    }

    fn on_failure(&self, error: PipelineError) {
        self.context
            .listener()
            .on_request_failure(&self.context, &error);
        let _ = self.sender.send(FetchEvent::Failure(error));
    }

    fn on_cancellation(&self) {
        self.context.listener().on_request_cancellation(&self.context);
        let _ = self.sender.send(FetchEvent::Cancelled);
    }

    fn on_progress_update(&self, progress: f32) {
        let _ = self.sender.send(FetchEvent::Progress(progress));
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Counters of every cache level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub bitmap_cache: MemoryCacheStats,
    pub encoded_cache: MemoryCacheStats,
    pub disk_cache: DiskCacheStats,
}

/// Collaborators for [`ImagePipeline`]; anything left unset gets its
/// default when the pipeline is built
pub struct ImagePipelineBuilder {
    config: PipelineConfig,
    executors: Option<ExecutorSupplier>,
    fetcher: Option<Arc<dyn NetworkFetcher>>,
    decoder: Option<Arc<dyn ImageDecoder>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    key_factory: Option<Arc<dyn CacheKeyFactory>>,
    listeners: Vec<Arc<dyn RequestListener>>,
}

impl ImagePipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            executors: None,
            fetcher: None,
            decoder: None,
            blob_store: None,
            key_factory: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_executors(mut self, executors: ExecutorSupplier) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn NetworkFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Backing store of the disk cache; in-memory by default
    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    pub fn with_cache_key_factory(mut self, factory: Arc<dyn CacheKeyFactory>) -> Self {
        self.key_factory = Some(factory);
        self
    }

    pub fn with_request_listener(mut self, listener: Arc<dyn RequestListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the pipeline. Needs a tokio runtime unless executors were set.
    pub fn build(self) -> Result<ImagePipeline> {
        let config = self.config;
        config.validate()?;

        let executors = match self.executors {
            Some(executors) => executors,
            None => ExecutorSupplier::current()?,
        };
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(CompositeFetcher::from_config(&config.network)?),
        };
        let decoder = self
            .decoder
            .unwrap_or_else(|| Arc::new(ImageCrateDecoder));
        let blob_store = self
            .blob_store
            .unwrap_or_else(|| Arc::new(InMemoryBlobStore::new()));
        let key_factory = self
            .key_factory
            .unwrap_or_else(|| Arc::new(DefaultCacheKeyFactory));

        let mut listeners = self.listeners;
        if config.log_requests {
            listeners.push(Arc::new(TracingRequestListener::new()));
        }
        let listener: Arc<dyn RequestListener> = match listeners.len() {
            0 => Arc::new(NoopRequestListener),
            1 => listeners.remove(0),
            _ => Arc::new(ForwardingRequestListener::new(listeners)),
        };

        let bitmap_cache = bitmap_memory_cache(config.bitmap_cache.clone());
        let encoded_cache = encoded_memory_cache(config.encoded_cache.clone());
        let disk_cache = DiskStorageCache::new(blob_store, config.disk_cache.max_size_bytes);
        let sequences = ProducerSequenceFactory::new(
            executors,
            fetcher,
            decoder,
            Arc::clone(&key_factory),
            bitmap_cache.clone(),
            encoded_cache.clone(),
            disk_cache.clone(),
        )
        .with_partial_result_interval(Duration::from_millis(
            config.network.partial_result_interval_ms,
        ));

        info!(
            bitmap_cache_bytes = config.bitmap_cache.max_cache_size,
            encoded_cache_bytes = config.encoded_cache.max_cache_size,
            disk_cache_bytes = config.disk_cache.max_size_bytes,
            "Image pipeline ready"
        );

        Ok(ImagePipeline {
            sequences,
            bitmap_cache,
            encoded_cache,
            disk_cache,
            key_factory,
            listener,
            next_id: AtomicU64::new(0),
        })
    }
}

/// Loads images through the memory caches, the disk cache and the fetcher
///
/// # Example
///
/// ```no_run
/// # use image_pipeline_core::{ImagePipeline, ImageRequest, PipelineConfig};
/// # tokio_test::block_on(async {
/// let pipeline = ImagePipeline::from_config(PipelineConfig::default())
///     .await
///     .unwrap();
///
/// let request = ImageRequest::from_uri("https://example.com/cat.png").unwrap();
/// if let Some(bitmap) = pipeline.fetch_decoded_image(request).unwrap().result().await.unwrap() {
///     let image = bitmap.get().unwrap();
///     println!("Decoded {}x{}", image.width(), image.height());
/// }
/// # });
/// ```
pub struct ImagePipeline {
    sequences: ProducerSequenceFactory,
    bitmap_cache: BitmapMemoryCache,
    encoded_cache: EncodedMemoryCache,
    disk_cache: DiskStorageCache,
    key_factory: Arc<dyn CacheKeyFactory>,
    listener: Arc<dyn RequestListener>,
    next_id: AtomicU64,
}

impl ImagePipeline {
    pub fn builder(config: PipelineConfig) -> ImagePipelineBuilder {
        ImagePipelineBuilder::new(config)
    }

    /// Pipeline with default collaborators on the current runtime. The disk
    /// cache lives in `config.disk_cache.directory` when one is set.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let store: Arc<dyn BlobStore> = match &config.disk_cache.directory {
            Some(directory) => Arc::new(FileBlobStore::open(directory).await?),
            None => Arc::new(InMemoryBlobStore::new()),
        };
        ImagePipelineBuilder::new(config)
            .with_blob_store(store)
            .build()
    }

    /// Decoded bitmap, postprocessed if the request has a postprocessor
    pub fn fetch_decoded_image(&self, request: ImageRequest) -> Result<ImageFetch<BitmapRef>> {
        let sequence = self.sequences.decoded_image_sequence(&request)?;
        Ok(self.submit(sequence, request, false))
    }

    /// Raw encoded bytes
    pub fn fetch_encoded_image(
        &self,
        request: ImageRequest,
    ) -> Result<ImageFetch<CloseableRef<Vec<u8>>>> {
        let sequence = self.sequences.encoded_image_sequence(&request)?;
        Ok(self.submit(sequence, request, false))
    }

    /// Fill the encoded memory and disk caches
    pub fn prefetch_to_disk_cache(&self, request: ImageRequest) -> Result<ImageFetch<()>> {
        let sequence = self.sequences.disk_prefetch_sequence(&request)?;
        Ok(self.submit(sequence, request, true))
    }

    /// Fill the bitmap memory cache
    pub fn prefetch_to_bitmap_cache(&self, request: ImageRequest) -> Result<ImageFetch<()>> {
        let sequence = self.sequences.bitmap_prefetch_sequence(&request)?;
        Ok(self.submit(sequence, request, true))
    }

    fn submit<T: Send + 'static>(
        &self,
        sequence: SharedProducer<T>,
        request: ImageRequest,
        is_prefetch: bool,
    ) -> ImageFetch<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let context = Arc::new(
            RequestContext::new(id, Arc::new(request), Arc::clone(&self.listener))
                .with_prefetch(is_prefetch)
                .with_intermediate_result_expected(!is_prefetch),
        );
        debug!(
            request_id = %context.id(),
            uri = %context.image_request().source_uri(),
            producer = sequence.name(),
            "Submitting request"
        );

        let (sender, events) = mpsc::unbounded_channel();
        self.listener.on_request_start(&context);
        let consumer = BaseConsumer::shared(FetchConsumer {
            context: Arc::clone(&context),
            sender,
        });
        sequence.produce_results(consumer, Arc::clone(&context));

        ImageFetch {
            context,
            events,
            finished: false,
        }
    }

    /// Whether the (postprocessed) bitmap for `request` is in memory
    pub fn is_in_bitmap_memory_cache(&self, request: &ImageRequest) -> bool {
        let key = self.key_factory.postprocessed_bitmap_cache_key(request);
        self.bitmap_cache.contains(&key)
    }

    pub async fn is_in_disk_cache(&self, request: &ImageRequest) -> Result<bool> {
        let key = self.key_factory.encoded_cache_key(request);
        self.disk_cache.contains(&key).await
    }

    /// Drop every memory cache entry built from `uri`; returns how many
    /// entries were removed
    pub fn evict_from_memory_cache(&self, uri: &str) -> usize {
        let source = self.key_factory.cache_key_source_uri(uri);
        let bitmaps = self.bitmap_cache.remove_all(|key| key.contains_uri(&source));
        let encoded = self.encoded_cache.remove_all(|key| key.contains_uri(&source));
        debug!(uri, bitmaps, encoded, "Evicted from memory caches");
        bitmaps + encoded
    }

    pub async fn evict_from_disk_cache(&self, uri: &str) -> Result<bool> {
        let request = ImageRequest::from_uri(uri)?;
        let key = self.key_factory.encoded_cache_key(&request);
        self.disk_cache.remove(&key).await
    }

    /// Evict `uri` from every cache level
    pub async fn evict_from_caches(&self, uri: &str) -> Result<()> {
        self.evict_from_memory_cache(uri);
        self.evict_from_disk_cache(uri).await?;
        Ok(())
    }

    pub fn clear_memory_caches(&self) {
        self.bitmap_cache.clear();
        self.encoded_cache.clear();
    }

    pub async fn clear_disk_caches(&self) -> Result<()> {
        self.disk_cache.clear().await
    }

    pub async fn clear_caches(&self) -> Result<()> {
        self.clear_memory_caches();
        self.clear_disk_caches().await
    }

    /// Shed `ratio` of each memory cache, e.g. on memory pressure
    pub fn trim_memory(&self, ratio: f64) {
        info!(ratio, "Trimming memory caches");
        self.bitmap_cache.trim(ratio);
        self.encoded_cache.trim(ratio);
    }

    pub fn bitmap_cache(&self) -> &BitmapMemoryCache {
        &self.bitmap_cache
    }

    pub fn encoded_cache(&self) -> &EncodedMemoryCache {
        &self.encoded_cache
    }

    pub fn disk_cache(&self) -> &DiskStorageCache {
        &self.disk_cache
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            bitmap_cache: self.bitmap_cache.stats(),
            encoded_cache: self.encoded_cache.stats(),
            disk_cache: self.disk_cache.stats(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
