//! Bitmap memory cache stages
//!
//! [`BitmapMemoryCacheProducer`] reads the cache and stores final upstream
//! bitmaps. [`BitmapMemoryCacheGetProducer`] only reads; it sits at the top
//! of a sequence, in front of the hand-off to the background executor, so a
//! hit is served on the caller's thread.

use crate::cache::{BitmapMemoryCache, CacheKey, CacheKeyFactory};
use crate::consumer::{DelegatingConsumer, ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::error::Result;
use crate::image_data::BitmapRef;
use crate::producer::{Producer, SharedProducer};
use crate::producers::cache_extras;
use crate::request::RequestLevel;
use std::sync::Arc;

const ORIGIN: &str = "memory_bitmap";

/// Bitmap cache lookup with write-back of upstream results
pub struct BitmapMemoryCacheProducer {
    cache: BitmapMemoryCache,
    key_factory: Arc<dyn CacheKeyFactory>,
    input: SharedProducer<BitmapRef>,
}

impl BitmapMemoryCacheProducer {
    pub const NAME: &'static str = "BitmapMemoryCacheProducer";

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

    fn produce(
        &self,
        name: &'static str,
        write: bool,
        consumer: SharedConsumer<BitmapRef>,
        context: Arc<RequestContext>,
    ) {
        let listener = context.listener();
        listener.on_producer_start(&context, name);

        let request = context.image_request();
        let key = self.key_factory.bitmap_cache_key(request);
        let memory_cache_enabled = request.memory_cache_enabled();

        let cached = if memory_cache_enabled {
            self.cache.get(&key)
        } else {
            None
        };
        if let Some(cached) = cached {
            let is_final = cached
                .get()
                .map(|image| image.quality().is_full_quality)
                .unwrap_or(false);
            if is_final {
                let extras = cache_extras(&context, name, true);
                listener.on_producer_finish_with_success(&context, name, extras.as_ref());
                listener.on_ultimate_producer_reached(&context, name, true);
                context.put_origin_extra(ORIGIN, None);
                consumer.on_progress_update(1.0);
                consumer.on_new_result(Some(cached), ResultStatus::IS_LAST);
                return;
            }
            consumer.on_new_result(Some(cached), ResultStatus::empty());
        }

        let extras = cache_extras(&context, name, false);
        if context.lowest_permitted_level() >= RequestLevel::BitmapMemoryCache {
            listener.on_producer_finish_with_success(&context, name, extras.as_ref());
            listener.on_ultimate_producer_reached(&context, name, false);
            context.put_origin_extra(ORIGIN, Some("nil-result"));
            consumer.on_new_result(None, ResultStatus::IS_LAST);
            return;
        }

        let consumer = if write {
            self.write_back(consumer, key, memory_cache_enabled)
        } else {
            consumer
        };
        listener.on_producer_finish_with_success(&context, name, extras.as_ref());
        self.input.produce_results(consumer, context);
    }

    /// Consumer caching non-partial upstream results before forwarding the
    /// cache's handle; intermediates no better than what is cached are
    /// replaced by the cached bitmap
    fn write_back(
        &self,
        consumer: SharedConsumer<BitmapRef>,
        key: CacheKey,
        memory_cache_enabled: bool,
    ) -> SharedConsumer<BitmapRef> {
        let cache = self.cache.clone();
        DelegatingConsumer::new(
            consumer,
            Self::NAME,
            move |downstream, result: Option<BitmapRef>, status: ResultStatus| -> Result<()> {
                let is_last = status.is_last();
                let Some(new_result) = result else {
                    if is_last {
                        downstream.on_new_result(None, status);
                    }
                    return Ok(());
                };
                if status.contains(ResultStatus::IS_PARTIAL_RESULT) {
                    downstream.on_new_result(Some(new_result), status);
                    return Ok(());
                }

                if !is_last {
                    if let Some(current) = cache.get(&key) {
                        let current_quality = current.get()?.quality();
                        let new_quality = new_result.get()?.quality();
                        if current_quality.is_full_quality
                            || current_quality.quality >= new_quality.quality
                        {
                            downstream.on_new_result(Some(current), status);
                            return Ok(());
                        }
                    }
                }

                let cached = if memory_cache_enabled {
                    cache.cache(key.clone(), &new_result, None)
                } else {
                    None
                };
                if is_last {
                    downstream.on_progress_update(1.0);
                }
                downstream.on_new_result(Some(cached.unwrap_or(new_result)), status);
                Ok(())
            },
        )
        .shared()
    }
}

impl Producer<BitmapRef> for BitmapMemoryCacheProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<BitmapRef>, context: Arc<RequestContext>) {
        self.produce(Self::NAME, true, consumer, context);
    }
}

/// Read-only bitmap cache lookup
pub struct BitmapMemoryCacheGetProducer {
    inner: BitmapMemoryCacheProducer,
}

impl BitmapMemoryCacheGetProducer {
    pub const NAME: &'static str = "BitmapMemoryCacheGetProducer";

    pub fn new(
        cache: BitmapMemoryCache,
        key_factory: Arc<dyn CacheKeyFactory>,
        input: SharedProducer<BitmapRef>,
    ) -> Self {
        Self {
            inner: BitmapMemoryCacheProducer::new(cache, key_factory, input),
        }
    }
}

impl Producer<BitmapRef> for BitmapMemoryCacheGetProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<BitmapRef>, context: Arc<RequestContext>) {
        self.inner.produce(Self::NAME, false, consumer, context);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::bitmap;
    use super::*;
    use crate::cache::{bitmap_memory_cache, DefaultCacheKeyFactory, MemoryCacheParams};
    use crate::consumer::test_support::{Event, RecordingConsumer};
    use crate::image_data::QualityInfo;
    use crate::producers::test_support::{recorded_context, ScriptedProducer};
    use crate::request::{ImageRequest, ImageRequestBuilder};

    const URI: &str = "https://images.test/bitmap.png";

    fn cache() -> BitmapMemoryCache {
        bitmap_memory_cache(MemoryCacheParams::with_byte_budget(4096))
    }

    fn key() -> CacheKey {
        DefaultCacheKeyFactory.bitmap_cache_key(&ImageRequest::from_uri(URI).unwrap())
    }

    fn widths(consumer: &RecordingConsumer<BitmapRef>) -> Vec<(Option<u32>, bool)> {
        consumer
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Result(result, status) => Some((
                    result.as_ref().map(|r| r.get().unwrap().width()),
                    status.is_last(),
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_miss_caches_final_and_later_hit_short_circuits() {
        let cache = cache();
        let upstream = ScriptedProducer::new(vec![
            (Some(bitmap(2, QualityInfo::partial(1))), ResultStatus::empty()),
            (Some(bitmap(4, QualityInfo::FULL_QUALITY)), ResultStatus::IS_LAST),
        ]);
        let producer =
            BitmapMemoryCacheProducer::new(cache.clone(), Arc::new(DefaultCacheKeyFactory), upstream.clone());

        let first = RecordingConsumer::new();
        let (context, listener) = recorded_context(ImageRequest::from_uri(URI).unwrap());
        producer.produce_results(first.clone(), context);

        assert_eq!(widths(&first), vec![(Some(2), false), (Some(4), true)]);
        assert!(listener
            .events()
            .contains(&"success:BitmapMemoryCacheProducer:cached_value_found".to_string()));
        assert_eq!(cache.count(), 1);
        assert!(first
            .last_result()
            .unwrap()
            .shares_value_with(&cache.get(&key()).unwrap()));

        let second = RecordingConsumer::new();
        let (context, listener) = recorded_context(ImageRequest::from_uri(URI).unwrap());
        producer.produce_results(second.clone(), context.clone());

        assert_eq!(widths(&second), vec![(Some(4), true)]);
        assert_eq!(upstream.calls(), 1);
        assert_eq!(listener.count("ultimate:BitmapMemoryCacheProducer:true"), 1);
        assert_eq!(
            context.extra(crate::context::EXTRA_ORIGIN),
            Some(serde_json::Value::from(ORIGIN))
        );
    }

    #[test]
    fn test_partial_hit_is_intermediate() {
        let cache = cache();
        let partial = bitmap(3, QualityInfo::partial(5));
        drop(cache.cache(key(), &partial, None));

        let upstream = ScriptedProducer::new(vec![(
            Some(bitmap(4, QualityInfo::FULL_QUALITY)),
            ResultStatus::IS_LAST,
        )]);
        let producer =
            BitmapMemoryCacheProducer::new(cache.clone(), Arc::new(DefaultCacheKeyFactory), upstream);

        let consumer = RecordingConsumer::new();
        let (context, _) = recorded_context(ImageRequest::from_uri(URI).unwrap());
        producer.produce_results(consumer.clone(), context);

        assert_eq!(widths(&consumer), vec![(Some(3), false), (Some(4), true)]);
        assert_eq!(consumer.terminal_count(), 1);
    }

    #[test]
    fn test_worse_intermediate_replaced_by_cached() {
        let cache = cache();
        drop(cache.cache(key(), &bitmap(3, QualityInfo::partial(5)), None));

        let upstream = ScriptedProducer::new(vec![(
            Some(bitmap(1, QualityInfo::partial(2))),
            ResultStatus::empty(),
        )]);
        let producer =
            BitmapMemoryCacheProducer::new(cache, Arc::new(DefaultCacheKeyFactory), upstream);

        let consumer = RecordingConsumer::new();
        let (context, _) = recorded_context(ImageRequest::from_uri(URI).unwrap());
        producer.produce_results(consumer.clone(), context);

        assert_eq!(widths(&consumer), vec![(Some(3), false), (Some(3), false)]);
    }

    #[test]
    fn test_bitmap_level_miss_is_none() {
        let upstream = ScriptedProducer::<BitmapRef>::new(Vec::new());
        let producer =
            BitmapMemoryCacheProducer::new(cache(), Arc::new(DefaultCacheKeyFactory), upstream.clone());
        let request = ImageRequestBuilder::new(URI)
            .with_lowest_permitted_level(RequestLevel::BitmapMemoryCache)
            .build()
            .unwrap();

        let consumer = RecordingConsumer::new();
        let (context, listener) = recorded_context(request);
        producer.produce_results(consumer.clone(), context);

        assert_eq!(widths(&consumer), vec![(None, true)]);
        assert_eq!(upstream.calls(), 0);
        assert_eq!(listener.count("ultimate:BitmapMemoryCacheProducer:false"), 1);
    }

    #[test]
    fn test_disabled_memory_cache_and_get_producer_do_not_write() {
        let cache = cache();
        let upstream = ScriptedProducer::new(vec![(
            Some(bitmap(4, QualityInfo::FULL_QUALITY)),
            ResultStatus::IS_LAST,
        )]);

        let producer =
            BitmapMemoryCacheProducer::new(cache.clone(), Arc::new(DefaultCacheKeyFactory), upstream.clone());
        let request = ImageRequestBuilder::new(URI)
            .with_memory_cache(false)
            .build()
            .unwrap();
        let consumer = RecordingConsumer::new();
        let (context, _) = recorded_context(request);
        producer.produce_results(consumer.clone(), context);
        assert_eq!(consumer.terminal_count(), 1);
        assert_eq!(cache.count(), 0);

        let getter =
            BitmapMemoryCacheGetProducer::new(cache.clone(), Arc::new(DefaultCacheKeyFactory), upstream);
        let consumer = RecordingConsumer::new();
        let (context, listener) = recorded_context(ImageRequest::from_uri(URI).unwrap());
        getter.produce_results(consumer.clone(), context);
        assert_eq!(widths(&consumer), vec![(Some(4), true)]);
        assert_eq!(cache.count(), 0);
        assert_eq!(listener.count("start:BitmapMemoryCacheGetProducer"), 1);
    }
}
