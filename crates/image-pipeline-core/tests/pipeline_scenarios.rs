//! End-to-end scenarios through `ImagePipeline`

use image_pipeline_core::cache::encoded_memory_cache;
use image_pipeline_core::context::EXTRA_ORIGIN;
use image_pipeline_core::fetch::StaticFetcher;
use image_pipeline_core::postprocess::GrayscalePostprocessor;
use image_pipeline_core::{
    CacheKey, CloseableRef, DecodedImage, EvictionPolicy, FetchEvent, FileBlobStore, ImagePipeline,
    ImageRequest, ImageRequestBuilder, InMemoryBlobStore, MemoryCacheParams, PipelineConfig,
    PipelineError, QualityInfo, RequestContext, RequestLevel, RequestListener,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const URI: &str = "https://images.test/scenario.png";

fn png(width: u32, height: u32) -> Vec<u8> {
    let bitmap = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 120, 240, 255]));
    DecodedImage::new(bitmap, QualityInfo::FULL_QUALITY)
        .to_png()
        .unwrap()
}

#[derive(Default)]
struct RequestEvents {
    events: Mutex<Vec<&'static str>>,
}

impl RequestEvents {
    fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }
}

impl RequestListener for RequestEvents {
    fn on_request_start(&self, _context: &RequestContext) {
        self.events.lock().push("start");
    }

    fn on_request_success(&self, _context: &RequestContext) {
        self.events.lock().push("success");
    }

    fn on_request_failure(&self, _context: &RequestContext, _error: &PipelineError) {
        self.events.lock().push("failure");
    }

    fn on_request_cancellation(&self, _context: &RequestContext) {
        self.events.lock().push("cancellation");
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("image_pipeline_core=debug")
        .with_test_writer()
        .try_init();
}

fn pipeline_with(fetcher: &StaticFetcher) -> (ImagePipeline, Arc<RequestEvents>) {
    init_tracing();
    let events = Arc::new(RequestEvents::default());
    let pipeline = ImagePipeline::builder(PipelineConfig::default())
        .with_fetcher(Arc::new(fetcher.clone()))
        .with_request_listener(events.clone())
        .build()
        .unwrap();
    (pipeline, events)
}

fn origin(context: &RequestContext) -> Option<Value> {
    context.extra(EXTRA_ORIGIN)
}

#[test]
fn test_byte_budget_evicts_first_released_entry() {
    for policy in [EvictionPolicy::Lru, EvictionPolicy::InsertionOrder] {
        let cache = encoded_memory_cache(
            MemoryCacheParams::with_byte_budget(100).with_eviction_policy(policy),
        );
        for uri in ["A", "B", "C"] {
            let value = CloseableRef::of(vec![0u8; 40]);
            drop(cache.cache(CacheKey::encoded(uri), &value, None));
        }

        assert!(!cache.contains(&CacheKey::encoded("A")), "{policy:?}");
        assert!(cache.contains(&CacheKey::encoded("B")));
        assert!(cache.contains(&CacheKey::encoded("C")));
        assert_eq!(cache.stats().exclusive_size_bytes, 80);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_requests_share_one_fetch_then_hit_memory() {
    let fetcher = StaticFetcher::new()
        .with_payload(URI, png(16, 8))
        .with_chunk_size(64)
        .with_chunk_delay(Duration::from_millis(10));
    let (pipeline, events) = pipeline_with(&fetcher);

    let first = pipeline
        .fetch_decoded_image(ImageRequest::from_uri(URI).unwrap())
        .unwrap();
    let second = pipeline
        .fetch_decoded_image(ImageRequest::from_uri(URI).unwrap())
        .unwrap();
    let (first, second) = tokio::join!(first.result(), second.result());
    let (first, second) = (first.unwrap().unwrap(), second.unwrap().unwrap());

    assert_eq!(fetcher.fetch_count(URI), 1);
    assert!(first.shares_value_with(&second));
    assert_eq!(first.get().unwrap().width(), 16);
    assert_eq!(events.count("success"), 2);

    let third = pipeline
        .fetch_decoded_image(ImageRequest::from_uri(URI).unwrap())
        .unwrap();
    let context = Arc::clone(third.context());
    let bitmap = third.result().await.unwrap().unwrap();
    assert_eq!(bitmap.get().unwrap().height(), 8);
    assert_eq!(fetcher.fetch_count(URI), 1);
    assert_eq!(origin(&context), Some(Value::from("memory_bitmap")));
}

#[tokio::test]
async fn test_cancel_during_fetch_ends_with_one_cancellation() {
    let fetcher = StaticFetcher::new()
        .with_payload(URI, png(32, 32))
        .with_chunk_size(8)
        .with_chunk_delay(Duration::from_millis(50));
    let (pipeline, events) = pipeline_with(&fetcher);

    let mut fetch = pipeline
        .fetch_decoded_image(ImageRequest::from_uri(URI).unwrap())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    fetch.cancel();

    let mut terminal = Vec::new();
    while let Some(event) = fetch.next_event().await {
        if event.is_terminal() {
            terminal.push(event);
        }
    }
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], FetchEvent::Cancelled));
    assert_eq!(events.count("cancellation"), 1);
    assert_eq!(events.count("success"), 0);
    assert!(!pipeline.is_in_bitmap_memory_cache(&ImageRequest::from_uri(URI).unwrap()));
}

#[tokio::test]
async fn test_dropping_unfinished_fetch_cancels_it() {
    let fetcher = StaticFetcher::new()
        .with_payload(URI, png(32, 32))
        .with_chunk_size(8)
        .with_chunk_delay(Duration::from_millis(50));
    let (pipeline, events) = pipeline_with(&fetcher);

    let fetch = pipeline
        .fetch_encoded_image(ImageRequest::from_uri(URI).unwrap())
        .unwrap();
    let context = Arc::clone(fetch.context());
    drop(fetch);

    assert!(context.is_cancelled());
    for _ in 0..50 {
        if events.count("cancellation") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(events.count("cancellation"), 1);
}

#[tokio::test]
async fn test_disk_cache_serves_a_new_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileBlobStore::open(dir.path()).await.unwrap());
    let fetcher = StaticFetcher::new().with_payload(URI, png(4, 4));
    let warm = ImagePipeline::builder(PipelineConfig::default())
        .with_fetcher(Arc::new(fetcher.clone()))
        .with_blob_store(store.clone())
        .build()
        .unwrap();

    warm.prefetch_to_disk_cache(ImageRequest::from_uri(URI).unwrap())
        .unwrap()
        .result()
        .await
        .unwrap();
    let request = ImageRequest::from_uri(URI).unwrap();
    for _ in 0..100 {
        if warm.is_in_disk_cache(&request).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(warm.is_in_disk_cache(&request).await.unwrap());

    let empty = StaticFetcher::new();
    let cold = ImagePipeline::builder(PipelineConfig::default())
        .with_fetcher(Arc::new(empty.clone()))
        .with_blob_store(store)
        .build()
        .unwrap();
    let fetch = cold.fetch_encoded_image(request).unwrap();
    let context = Arc::clone(fetch.context());
    let bytes = fetch.result().await.unwrap().unwrap();

    assert_eq!(bytes.get().unwrap().as_slice(), png(4, 4).as_slice());
    assert_eq!(empty.fetch_count(URI), 0);
    assert_eq!(origin(&context), Some(Value::from("disk")));
}

#[tokio::test]
async fn test_memory_only_request_on_cold_cache_yields_nothing() {
    let fetcher = StaticFetcher::new().with_payload(URI, png(4, 4));
    let (pipeline, events) = pipeline_with(&fetcher);
    let request = ImageRequestBuilder::new(URI)
        .with_lowest_permitted_level(RequestLevel::BitmapMemoryCache)
        .build()
        .unwrap();

    let result = pipeline
        .fetch_decoded_image(request)
        .unwrap()
        .result()
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(fetcher.fetch_count(URI), 0);
    assert_eq!(events.count("success"), 1);
}

#[tokio::test]
async fn test_bitmap_prefetch_fills_memory_cache() {
    let fetcher = StaticFetcher::new().with_payload(URI, png(5, 5));
    let (pipeline, _) = pipeline_with(&fetcher);
    let request = ImageRequest::from_uri(URI).unwrap();

    let result = pipeline
        .prefetch_to_bitmap_cache(request.clone())
        .unwrap()
        .result()
        .await
        .unwrap();
    assert!(result.is_none());
    assert!(pipeline.is_in_bitmap_memory_cache(&request));

    // the decode thread drops its client handles after delivering
    for _ in 0..100 {
        if pipeline.bitmap_cache().in_use_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pipeline.bitmap_cache().exclusive_count(), 1);

    pipeline.trim_memory(1.0);
    assert!(!pipeline.is_in_bitmap_memory_cache(&request));
}

#[tokio::test]
async fn test_postprocessed_result_is_cached_separately() {
    let fetcher = StaticFetcher::new().with_payload(URI, png(3, 2));
    let (pipeline, _) = pipeline_with(&fetcher);
    let request = || {
        ImageRequestBuilder::new(URI)
            .with_postprocessor(Arc::new(GrayscalePostprocessor))
            .build()
            .unwrap()
    };

    let gray = pipeline
        .fetch_decoded_image(request())
        .unwrap()
        .result()
        .await
        .unwrap()
        .unwrap();
    let [r, g, b, _] = gray.get().unwrap().bitmap().get_pixel(0, 0).0;
    assert_eq!((r, g), (g, b));
    assert!(pipeline.is_in_bitmap_memory_cache(&request()));

    let fetch = pipeline.fetch_decoded_image(request()).unwrap();
    let context = Arc::clone(fetch.context());
    fetch.result().await.unwrap().unwrap();
    assert_eq!(fetcher.fetch_count(URI), 1);
    assert_eq!(
        context.extra("origin_sub"),
        Some(Value::from("postprocessed"))
    );
}

#[tokio::test]
async fn test_resized_request_is_decoded_and_fitted() {
    let fetcher = StaticFetcher::new().with_payload(URI, png(40, 20));
    let (pipeline, _) = pipeline_with(&fetcher);
    let request = ImageRequestBuilder::new(URI)
        .with_resize_options(image_pipeline_core::request::ResizeOptions::new(10, 10))
        .build()
        .unwrap();

    let bitmap = pipeline
        .fetch_decoded_image(request)
        .unwrap()
        .result()
        .await
        .unwrap()
        .unwrap();
    let image = bitmap.get().unwrap();
    assert_eq!((image.width(), image.height()), (10, 5));
}

#[tokio::test]
async fn test_local_file_is_fetched_without_disk_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local.png");
    std::fs::write(&path, png(7, 3)).unwrap();
    let pipeline = ImagePipeline::builder(PipelineConfig::default())
        .with_blob_store(Arc::new(InMemoryBlobStore::new()))
        .build()
        .unwrap();

    let request = ImageRequest::from_uri(path.display().to_string()).unwrap();
    let bitmap = pipeline
        .fetch_decoded_image(request.clone())
        .unwrap()
        .result()
        .await
        .unwrap()
        .unwrap();

    assert_eq!(bitmap.get().unwrap().width(), 7);
    assert!(!pipeline.is_in_disk_cache(&request).await.unwrap());
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let fetcher = StaticFetcher::new()
        .with_payload(URI, png(24, 24))
        .with_chunk_size(16);
    let (pipeline, _) = pipeline_with(&fetcher);
    let request = ImageRequestBuilder::new(URI)
        .with_progressive_rendering(true)
        .build()
        .unwrap();

    let mut fetch = pipeline.fetch_decoded_image(request).unwrap();
    let mut progress = Vec::new();
    let mut finals = 0;
    while let Some(event) = fetch.next_event().await {
        match event {
            FetchEvent::Progress(p) => progress.push(p),
            FetchEvent::Final(Some(_)) => finals += 1,
            FetchEvent::Failure(error) => panic!("fetch failed: {error}"),
            _ => {}
        }
    }

    assert_eq!(finals, 1);
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_malformed_payload_fails_with_decode_error() {
    let fetcher = StaticFetcher::new().with_payload(URI, b"definitely not an image".to_vec());
    let (pipeline, events) = pipeline_with(&fetcher);

    let error = pipeline
        .fetch_decoded_image(ImageRequest::from_uri(URI).unwrap())
        .unwrap()
        .result()
        .await
        .unwrap_err();

    assert!(matches!(error.root(), PipelineError::Decode { .. }));
    assert_eq!(events.count("failure"), 1);
}
