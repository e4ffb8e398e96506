//! Disk cache read and write stages for encoded bytes

use crate::cache::{CacheKeyFactory, DiskStorageCache};
use crate::consumer::{DelegatingConsumer, ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::executor::ExecutorSupplier;
use crate::image_data::EncodedImage;
use crate::producer::{Producer, SharedProducer};
use crate::producers::cache_extras;
use crate::request::RequestLevel;
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves encoded bytes from the disk cache, falling back to its upstream
pub struct DiskCacheReadProducer {
    disk_cache: DiskStorageCache,
    key_factory: Arc<dyn CacheKeyFactory>,
    executors: ExecutorSupplier,
    input: SharedProducer<EncodedImage>,
}

impl DiskCacheReadProducer {
    pub const NAME: &'static str = "DiskCacheProducer";

    pub fn new(
        disk_cache: DiskStorageCache,
        key_factory: Arc<dyn CacheKeyFactory>,
        executors: ExecutorSupplier,
        input: SharedProducer<EncodedImage>,
    ) -> Self {
        Self {
            disk_cache,
            key_factory,
            executors,
            input,
        }
    }
}

impl Producer<EncodedImage> for DiskCacheReadProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<EncodedImage>, context: Arc<RequestContext>) {
        if !context.image_request().disk_cache_enabled() {
            self.input.produce_results(consumer, context);
            return;
        }

        context.listener().on_producer_start(&context, Self::NAME);
        let key = self.key_factory.encoded_cache_key(context.image_request());
        let disk_cache = self.disk_cache.clone();
        let input = Arc::clone(&self.input);

        self.executors.spawn_io(async move {
            let token = context.cancellation_token();
            let lookup = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                found = disk_cache.get(&key) => Some(found),
            };

            let listener = context.listener();
            match lookup {
                None => {
                    listener.on_producer_finish_with_cancellation(&context, Self::NAME, None);
                    consumer.on_cancellation();
                }
                Some(Ok(Some(bytes))) => {
                    debug!(request_id = %context.id(), bytes = bytes.len(), "Disk cache hit");
                    let extras = cache_extras(&context, Self::NAME, true);
                    listener.on_producer_finish_with_success(&context, Self::NAME, extras.as_ref());
                    listener.on_ultimate_producer_reached(&context, Self::NAME, true);
                    context.put_origin_extra("disk", Some("default"));
                    consumer.on_progress_update(1.0);
                    consumer.on_new_result(Some(EncodedImage::from_vec(bytes)), ResultStatus::IS_LAST);
                }
                Some(Ok(None)) => {
                    let extras = cache_extras(&context, Self::NAME, false);
                    listener.on_producer_finish_with_success(&context, Self::NAME, extras.as_ref());
                    input.produce_results(consumer, context);
                }
                Some(Err(error)) => {
                    // a broken disk cache is treated as a miss
                    warn!(request_id = %context.id(), "Disk cache read failed: {}", error);
                    listener.on_producer_finish_with_failure(&context, Self::NAME, &error, None);
                    input.produce_results(consumer, context);
                }
            }
        });
    }
}

/// Writes final encoded results to the disk cache in the background
pub struct DiskCacheWriteProducer {
    disk_cache: DiskStorageCache,
    key_factory: Arc<dyn CacheKeyFactory>,
    executors: ExecutorSupplier,
    input: SharedProducer<EncodedImage>,
}

impl DiskCacheWriteProducer {
    pub const NAME: &'static str = "DiskCacheWriteProducer";

    pub fn new(
        disk_cache: DiskStorageCache,
        key_factory: Arc<dyn CacheKeyFactory>,
        executors: ExecutorSupplier,
        input: SharedProducer<EncodedImage>,
    ) -> Self {
        Self {
            disk_cache,
            key_factory,
            executors,
            input,
        }
    }
}

impl Producer<EncodedImage> for DiskCacheWriteProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<EncodedImage>, context: Arc<RequestContext>) {
        let listener = context.listener();
        listener.on_producer_start(&context, Self::NAME);

        if context.lowest_permitted_level() >= RequestLevel::DiskCache {
            context.put_origin_extra("disk", Some("nil-result_write"));
            listener.on_producer_finish_with_success(&context, Self::NAME, None);
            consumer.on_new_result(None, ResultStatus::IS_LAST);
            return;
        }

        let consumer = if context.image_request().disk_cache_enabled() {
            let key = self.key_factory.encoded_cache_key(context.image_request());
            let disk_cache = self.disk_cache.clone();
            let executors = self.executors.clone();
            let request_id = context.id().to_string();
            DelegatingConsumer::new(
                consumer,
                Self::NAME,
                move |downstream, result: Option<EncodedImage>, status: ResultStatus| {
                    let cacheable = status.is_last()
                        && !status.intersects(
                            ResultStatus::DO_NOT_CACHE_ENCODED | ResultStatus::IS_PARTIAL_RESULT,
                        );
                    if let Some(encoded) = result.as_ref().filter(|_| cacheable) {
                        let bytes = encoded.bytes()?.to_vec();
                        let disk_cache = disk_cache.clone();
                        let key = key.clone();
                        let request_id = request_id.clone();
                        executors.spawn_io(async move {
                            if let Err(e) = disk_cache.insert(&key, &bytes).await {
                                warn!(request_id = %request_id, "Disk cache write failed: {}", e);
                            }
                        });
                    }
                    downstream.on_new_result(result, status);
                    Ok(())
                },
            )
            .shared()
        } else {
            consumer
        };

        listener.on_producer_finish_with_success(&context, Self::NAME, None);
        self.input.produce_results(consumer, context);
    }
}
