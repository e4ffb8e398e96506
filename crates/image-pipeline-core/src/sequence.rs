//! Producer sequence construction
//!
//! Sequences are built lazily, once per source kind, and shared by every
//! request of that kind so the multiplexers and caches inside them see all
//! concurrent requests. Stages are listed from the consumer end:
//!
//! ```text
//! decoded (network):  BitmapCacheGet -> ThreadHandoff -> BitmapMultiplex
//!                     -> BitmapCache -> ResizeAndRotate -> Decode
//!                     -> AddMetaData -> EncodedMultiplex -> EncodedCache
//!                     -> DiskCacheRead -> DiskCacheWrite -> NetworkFetch
//! decoded (local):    same, without the disk cache stages
//! postprocessed:      PostprocessedBitmapCache -> Postprocessor -> decoded
//! encoded:            RemoveMetaData -> EncodedMultiplex -> ...
//! prefetch:           SwallowResult -> encoded or decoded sequence
//! ```

use crate::cache::{BitmapMemoryCache, CacheKeyFactory, DiskStorageCache, EncodedMemoryCache};
use crate::decoder::ImageDecoder;
use crate::error::{PipelineError, Result};
use crate::executor::ExecutorSupplier;
use crate::fetch::NetworkFetcher;
use crate::image_data::{BitmapRef, EncodedImage};
use crate::producer::SharedProducer;
use crate::producers::{
    bitmap_multiplex, encoded_multiplex, AddMetaDataProducer, BitmapMemoryCacheGetProducer,
    BitmapMemoryCacheProducer, DecodeProducer, DiskCacheReadProducer, DiskCacheWriteProducer,
    EncodedMemoryCacheProducer, NetworkFetchProducer, PostprocessedBitmapMemoryCacheProducer,
    PostprocessorProducer, RemoveMetaDataProducer, ResizeAndRotateProducer,
    SwallowResultProducer, ThreadHandoffProducer,
};
use crate::reference::CloseableRef;
use crate::request::ImageRequest;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Where a request's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// `http://` or `https://`
    Network,

    /// `file://` uri or plain path
    LocalFile,
}

impl SourceKind {
    pub fn of(request: &ImageRequest) -> Result<Self> {
        if request.is_network_uri() {
            return Ok(Self::Network);
        }
        let uri = request.source_uri();
        match uri.split_once("://") {
            None => Ok(Self::LocalFile),
            Some((scheme, _)) if scheme.eq_ignore_ascii_case("file") => Ok(Self::LocalFile),
            Some((scheme, _)) => Err(PipelineError::InvalidRequest(format!(
                "unsupported uri scheme '{scheme}' in {uri}"
            ))),
        }
    }
}

#[derive(Default)]
struct Sequences {
    encoded_fetch: HashMap<SourceKind, SharedProducer<EncodedImage>>,
    decoded: HashMap<SourceKind, SharedProducer<BitmapRef>>,
    postprocessed: HashMap<SourceKind, SharedProducer<BitmapRef>>,
    encoded: HashMap<SourceKind, SharedProducer<CloseableRef<Vec<u8>>>>,
    disk_prefetch: HashMap<SourceKind, SharedProducer<()>>,
    bitmap_prefetch: HashMap<(SourceKind, bool), SharedProducer<()>>,
}

/// Builds and memoizes the producer chains behind each pipeline operation
pub struct ProducerSequenceFactory {
    executors: ExecutorSupplier,
    fetcher: Arc<dyn NetworkFetcher>,
    decoder: Arc<dyn ImageDecoder>,
    key_factory: Arc<dyn CacheKeyFactory>,
    bitmap_cache: BitmapMemoryCache,
    encoded_cache: EncodedMemoryCache,
    disk_cache: DiskStorageCache,
    partial_result_interval: Duration,
    sequences: Mutex<Sequences>,
}

impl ProducerSequenceFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executors: ExecutorSupplier,
        fetcher: Arc<dyn NetworkFetcher>,
        decoder: Arc<dyn ImageDecoder>,
        key_factory: Arc<dyn CacheKeyFactory>,
        bitmap_cache: BitmapMemoryCache,
        encoded_cache: EncodedMemoryCache,
        disk_cache: DiskStorageCache,
    ) -> Self {
        Self {
            executors,
            fetcher,
            decoder,
            key_factory,
            bitmap_cache,
            encoded_cache,
            disk_cache,
            partial_result_interval: Duration::from_millis(100),
            sequences: Mutex::new(Sequences::default()),
        }
    }

    /// Minimum spacing of progressive network results
    pub fn with_partial_result_interval(mut self, interval: Duration) -> Self {
        self.partial_result_interval = interval;
        self
    }

    pub fn key_factory(&self) -> &Arc<dyn CacheKeyFactory> {
        &self.key_factory
    }

    /// Sequence delivering decoded (and, if requested, postprocessed)
    /// bitmaps
    pub fn decoded_image_sequence(
        &self,
        request: &ImageRequest,
    ) -> Result<SharedProducer<BitmapRef>> {
        let kind = SourceKind::of(request)?;
        if request.postprocessor().is_some() {
            Ok(self.postprocessed_sequence(kind))
        } else {
            Ok(self.basic_decoded_sequence(kind))
        }
    }

    /// Sequence delivering the raw encoded bytes
    pub fn encoded_image_sequence(
        &self,
        request: &ImageRequest,
    ) -> Result<SharedProducer<CloseableRef<Vec<u8>>>> {
        let kind = SourceKind::of(request)?;
        let mut sequences = self.sequences.lock();
        if let Some(existing) = sequences.encoded.get(&kind) {
            return Ok(Arc::clone(existing));
        }
        let fetch = self.encoded_fetch_sequence(&mut sequences, kind);
        let sequence: SharedProducer<CloseableRef<Vec<u8>>> =
            Arc::new(RemoveMetaDataProducer::new(fetch));
        sequences.encoded.insert(kind, Arc::clone(&sequence));
        Ok(sequence)
    }

    /// Sequence that fills the encoded caches and discards the bytes
    pub fn disk_prefetch_sequence(&self, request: &ImageRequest) -> Result<SharedProducer<()>> {
        let kind = SourceKind::of(request)?;
        let mut sequences = self.sequences.lock();
        if let Some(existing) = sequences.disk_prefetch.get(&kind) {
            return Ok(Arc::clone(existing));
        }
        let fetch = self.encoded_fetch_sequence(&mut sequences, kind);
        let sequence: SharedProducer<()> = Arc::new(SwallowResultProducer::new(fetch));
        sequences.disk_prefetch.insert(kind, Arc::clone(&sequence));
        Ok(sequence)
    }

    /// Sequence that fills the bitmap cache and discards the bitmap
    pub fn bitmap_prefetch_sequence(&self, request: &ImageRequest) -> Result<SharedProducer<()>> {
        let kind = SourceKind::of(request)?;
        let postprocessed = request.postprocessor().is_some();
        let key = (kind, postprocessed);
        if let Some(existing) = self.sequences.lock().bitmap_prefetch.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let decoded = self.decoded_image_sequence(request)?;
        let sequence: SharedProducer<()> = Arc::new(SwallowResultProducer::new(decoded));
        Ok(Arc::clone(
            self.sequences
                .lock()
                .bitmap_prefetch
                .entry(key)
                .or_insert(sequence),
        ))
    }

    fn postprocessed_sequence(&self, kind: SourceKind) -> SharedProducer<BitmapRef> {
        if let Some(existing) = self.sequences.lock().postprocessed.get(&kind) {
            return Arc::clone(existing);
        }
        let base = self.basic_decoded_sequence(kind);
        let postprocessor: SharedProducer<BitmapRef> =
            Arc::new(PostprocessorProducer::new(self.executors.clone(), base));
        let sequence: SharedProducer<BitmapRef> =
            Arc::new(PostprocessedBitmapMemoryCacheProducer::new(
                self.bitmap_cache.clone(),
                Arc::clone(&self.key_factory),
                postprocessor,
            ));
        Arc::clone(
            self.sequences
                .lock()
                .postprocessed
                .entry(kind)
                .or_insert(sequence),
        )
    }

    fn basic_decoded_sequence(&self, kind: SourceKind) -> SharedProducer<BitmapRef> {
        let mut sequences = self.sequences.lock();
        if let Some(existing) = sequences.decoded.get(&kind) {
            return Arc::clone(existing);
        }
        debug!(?kind, "Building decoded image sequence");

        let encoded = self.encoded_fetch_sequence(&mut sequences, kind);
        let with_metadata: SharedProducer<EncodedImage> =
            Arc::new(AddMetaDataProducer::new(encoded));
        let decode: SharedProducer<BitmapRef> = Arc::new(DecodeProducer::new(
            Arc::clone(&self.decoder),
            self.executors.clone(),
            with_metadata,
        ));
        let resize: SharedProducer<BitmapRef> = Arc::new(ResizeAndRotateProducer::new(decode));
        let sequence = self.bitmap_cache_get_to_bitmap_cache(resize);

        sequences.decoded.insert(kind, Arc::clone(&sequence));
        sequence
    }

    /// Cache, dedup and hand-off stages shared by all decoded sequences
    fn bitmap_cache_get_to_bitmap_cache(
        &self,
        input: SharedProducer<BitmapRef>,
    ) -> SharedProducer<BitmapRef> {
        let cache: SharedProducer<BitmapRef> = Arc::new(BitmapMemoryCacheProducer::new(
            self.bitmap_cache.clone(),
            Arc::clone(&self.key_factory),
            input,
        ));
        let multiplex: SharedProducer<BitmapRef> =
            Arc::new(bitmap_multiplex(Arc::clone(&self.key_factory), cache));
        let handoff: SharedProducer<BitmapRef> =
            Arc::new(ThreadHandoffProducer::new(multiplex, self.executors.clone()));
        Arc::new(BitmapMemoryCacheGetProducer::new(
            self.bitmap_cache.clone(),
            Arc::clone(&self.key_factory),
            handoff,
        ))
    }

    /// Fetch through the encoded caches, built once per source kind
    fn encoded_fetch_sequence(
        &self,
        sequences: &mut Sequences,
        kind: SourceKind,
    ) -> SharedProducer<EncodedImage> {
        if let Some(existing) = sequences.encoded_fetch.get(&kind) {
            return Arc::clone(existing);
        }
        debug!(?kind, "Building encoded fetch sequence");

        let mut producer: SharedProducer<EncodedImage> = Arc::new(
            NetworkFetchProducer::new(Arc::clone(&self.fetcher), self.executors.clone())
                .with_partial_result_interval(self.partial_result_interval),
        );
        if kind == SourceKind::Network {
            producer = Arc::new(DiskCacheWriteProducer::new(
                self.disk_cache.clone(),
                Arc::clone(&self.key_factory),
                self.executors.clone(),
                producer,
            ));
            producer = Arc::new(DiskCacheReadProducer::new(
                self.disk_cache.clone(),
                Arc::clone(&self.key_factory),
                self.executors.clone(),
                producer,
            ));
        }
        let cache: SharedProducer<EncodedImage> = Arc::new(EncodedMemoryCacheProducer::new(
            self.encoded_cache.clone(),
            Arc::clone(&self.key_factory),
            producer,
        ));
        let sequence: SharedProducer<EncodedImage> =
            Arc::new(encoded_multiplex(Arc::clone(&self.key_factory), cache));

        sequences.encoded_fetch.insert(kind, Arc::clone(&sequence));
        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{
        bitmap_memory_cache, encoded_memory_cache, DefaultCacheKeyFactory, MemoryCacheParams,
    };
    use crate::decoder::ImageCrateDecoder;
    use crate::fetch::StaticFetcher;
    use crate::postprocess::GrayscalePostprocessor;
    use crate::request::ImageRequestBuilder;
    use crate::storage::InMemoryBlobStore;

    fn factory() -> ProducerSequenceFactory {
        ProducerSequenceFactory::new(
            ExecutorSupplier::current().unwrap(),
            Arc::new(StaticFetcher::new()),
            Arc::new(ImageCrateDecoder),
            Arc::new(DefaultCacheKeyFactory),
            bitmap_memory_cache(MemoryCacheParams::with_byte_budget(1024)),
            encoded_memory_cache(MemoryCacheParams::with_byte_budget(1024)),
            DiskStorageCache::new(Arc::new(InMemoryBlobStore::new()), 1024),
        )
    }

    #[test]
    fn test_source_kind() {
        let kind = |uri: &str| SourceKind::of(&ImageRequest::from_uri(uri).unwrap());
        assert_eq!(kind("https://a/b.png").unwrap(), SourceKind::Network);
        assert_eq!(kind("HTTP://a/b.png").unwrap(), SourceKind::Network);
        assert_eq!(kind("file:///tmp/b.png").unwrap(), SourceKind::LocalFile);
        assert_eq!(kind("/tmp/b.png").unwrap(), SourceKind::LocalFile);
        assert!(matches!(
            kind("ftp://a/b.png"),
            Err(PipelineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_sequences_are_memoized_per_kind() {
        let factory = factory();
        let a = ImageRequest::from_uri("https://a/1.png").unwrap();
        let b = ImageRequest::from_uri("https://b/2.png").unwrap();
        let local = ImageRequest::from_uri("/tmp/3.png").unwrap();

        let first = factory.decoded_image_sequence(&a).unwrap();
        let second = factory.decoded_image_sequence(&b).unwrap();
        let third = factory.decoded_image_sequence(&local).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.name(), BitmapMemoryCacheGetProducer::NAME);

        let encoded = factory.encoded_image_sequence(&a).unwrap();
        assert!(Arc::ptr_eq(&encoded, &factory.encoded_image_sequence(&b).unwrap()));
        assert_eq!(encoded.name(), RemoveMetaDataProducer::NAME);
    }

    #[tokio::test]
    async fn test_postprocessor_selects_postprocessed_sequence() {
        let factory = factory();
        let request = ImageRequestBuilder::new("https://a/1.png")
            .with_postprocessor(Arc::new(GrayscalePostprocessor))
            .build()
            .unwrap();

        let sequence = factory.decoded_image_sequence(&request).unwrap();
        assert_eq!(sequence.name(), PostprocessedBitmapMemoryCacheProducer::NAME);

        let prefetch = factory.bitmap_prefetch_sequence(&request).unwrap();
        assert!(Arc::ptr_eq(
            &prefetch,
            &factory.bitmap_prefetch_sequence(&request).unwrap()
        ));
        let plain = ImageRequest::from_uri("https://a/1.png").unwrap();
        assert!(!Arc::ptr_eq(
            &prefetch,
            &factory.bitmap_prefetch_sequence(&plain).unwrap()
        ));
    }
}
