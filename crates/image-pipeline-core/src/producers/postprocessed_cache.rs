//! Memory cache stage for postprocessed bitmaps

use crate::cache::{BitmapMemoryCache, CacheKeyFactory};
use crate::consumer::{DelegatingConsumer, ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::image_data::BitmapRef;
use crate::producer::{Producer, SharedProducer};
use crate::producers::cache_extras;
use std::sync::Arc;

/// Caches postprocessor output under the postprocessed bitmap key.
///
/// Requests whose postprocessor has no cache key pass straight through.
pub struct PostprocessedBitmapMemoryCacheProducer {
    cache: BitmapMemoryCache,
    key_factory: Arc<dyn CacheKeyFactory>,
    input: SharedProducer<BitmapRef>,
}

impl PostprocessedBitmapMemoryCacheProducer {
    pub const NAME: &'static str = "PostprocessedBitmapMemoryCacheProducer";

    pub fn new(
        cache: BitmapMemoryCache,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: SharedProducer<BitmapRef>,
    ) -> Self {
        Self {
            cache,
            key_factory,
            input,
        }
    }
}

impl Producer<BitmapRef> for PostprocessedBitmapMemoryCacheProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<BitmapRef>, context: Arc<RequestContext>) {
        let request = context.image_request();
        let is_repeated = request
            .postprocessor()
            .filter(|postprocessor| postprocessor.cache_key().is_some())
            .map(|postprocessor| postprocessor.is_repeated());
        let Some(is_repeated) = is_repeated else {
            self.input.produce_results(consumer, context);
            return;
        };

        let listener = context.listener();
        listener.on_producer_start(&context, Self::NAME);
        let key = self.key_factory.postprocessed_bitmap_cache_key(request);
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
            context.put_origin_extra("memory_bitmap", Some("postprocessed"));
            consumer.on_progress_update(1.0);
            consumer.on_new_result(Some(cached), ResultStatus::IS_LAST);
            return;
        }

        let cache = self.cache.clone();
        let wrapped = DelegatingConsumer::new(
            consumer,
            Self::NAME,
            move |downstream, result: Option<BitmapRef>, status: ResultStatus| {
                let Some(processed) = result else {
                    if status.is_last() {
                        downstream.on_new_result(None, status);
                    }
                    return Ok(());
                };
                if status.is_not_last() && !is_repeated {
                    return Ok(());
                }

                let cached = if memory_cache_enabled {
                    cache.cache(key.clone(), &processed, None)
                } else {
                    None
                };
                downstream.on_progress_update(1.0);
                downstream.on_new_result(Some(cached.unwrap_or(processed)), status);
                Ok(())
            },
        );

        let extras = cache_extras(&context, Self::NAME, false);
        listener.on_producer_finish_with_success(&context, Self::NAME, extras.as_ref());
        self.input.produce_results(wrapped.shared(), context);
    }
}
