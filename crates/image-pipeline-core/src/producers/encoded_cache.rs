//! Encoded memory cache stage

use crate::cache::{CacheKeyFactory, EncodedMemoryCache};
use crate::consumer::{DelegatingConsumer, ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::image_data::EncodedImage;
use crate::producer::{Producer, SharedProducer};
use crate::producers::cache_extras;
use crate::request::RequestLevel;
use std::sync::Arc;

/// Serves encoded bytes from memory and caches final upstream results
pub struct EncodedMemoryCacheProducer {
    cache: EncodedMemoryCache,
    key_factory: Arc<dyn CacheKeyFactory>,
    input: SharedProducer<EncodedImage>,
}

impl EncodedMemoryCacheProducer {
    pub const NAME: &'static str = "EncodedMemoryCacheProducer";

    pub fn new(
        cache: EncodedMemoryCache,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: SharedProducer<EncodedImage>,
    ) -> Self {
        Self {
            cache,
            key_factory,
            input,
        }
    }
}

impl Producer<EncodedImage> for EncodedMemoryCacheProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<EncodedImage>, context: Arc<RequestContext>) {
        let listener = context.listener();
        listener.on_producer_start(&context, Self::NAME);

        let request = context.image_request();
        let key = self.key_factory.encoded_cache_key(request);
        let memory_cache_enabled = request.memory_cache_enabled();

        let cached = if memory_cache_enabled {
            self.cache.get(&key)
        } else {
            None
        };
        if let Some(cached) = cached {
            let extras = cache_extras(&context, Self::NAME, true);
            listener.on_producer_finish_with_success(&context, Self::NAME, extras.as_ref());
            listener.on_ultimate_producer_reached(&context, Self::NAME, true);
            context.put_origin_extra("memory_encoded", None);
            consumer.on_progress_update(1.0);
            consumer.on_new_result(Some(EncodedImage::new(cached)), ResultStatus::IS_LAST);
            return;
        }

        let extras = cache_extras(&context, Self::NAME, false);
        if context.lowest_permitted_level() >= RequestLevel::EncodedMemoryCache {
            listener.on_producer_finish_with_success(&context, Self::NAME, extras.as_ref());
            listener.on_ultimate_producer_reached(&context, Self::NAME, false);
            context.put_origin_extra("memory_encoded", Some("nil-result"));
            consumer.on_new_result(None, ResultStatus::IS_LAST);
            return;
        }

        let cache = self.cache.clone();
        let wrapped = DelegatingConsumer::new(
            consumer,
            Self::NAME,
            move |downstream, result: Option<EncodedImage>, status: ResultStatus| {
                let cacheable = memory_cache_enabled
                    && status.is_last()
                    && !status.intersects(
                        ResultStatus::DO_NOT_CACHE_ENCODED | ResultStatus::IS_PARTIAL_RESULT,
                    );
                let encoded = match result {
                    Some(encoded) if cacheable => encoded,
                    other => {
                        downstream.on_new_result(other, status);
                        return Ok(());
                    }
                };

                match cache.cache(key.clone(), encoded.bytes_ref(), None) {
                    Some(cached) => {
                        let cached = EncodedImage::new(cached).with_metadata_from(&encoded);
                        drop(encoded);
                        downstream.on_progress_update(1.0);
                        downstream.on_new_result(Some(cached), status);
                    }
                    None => downstream.on_new_result(Some(encoded), status),
                }
                Ok(())
            },
        );

        listener.on_producer_finish_with_success(&context, Self::NAME, extras.as_ref());
        self.input.produce_results(wrapped.shared(), context);
    }
}
