//! Merging of identical in-flight requests
//!
//! A [`MultiplexProducer`] keeps one multiplexer per key. The first request
//! for a key starts the upstream with a context of its own; later requests
//! for the same key join the fan-out list and immediately receive the last
//! intermediate result and progress. The terminal event goes to every
//! attached consumer and removes the multiplexer from the map under the
//! multiplexer lock, so a consumer either joins before the terminal event and
//! receives it, or finds the multiplexer closed and starts a fresh one.
//!
//! Lock order is multiplexer state, then the map.

use crate::cache::{CacheKey, CacheKeyFactory};
use crate::consumer::{Consumer, ResultStatus, SharedConsumer};
use crate::context::{ContextCallbacks, RequestContext};
use crate::error::PipelineError;
use crate::image_data::{BitmapRef, EncodedImage};
use crate::producer::{Producer, SharedProducer};
use crate::request::{Priority, RequestLevel};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Extras key with the number of requests served by one bitmap upstream
pub const EXTRA_BITMAP_DEDUP_COUNT: &str = "multiplex_bmp_cnt";

/// Extras key with the number of requests served by one encoded upstream
pub const EXTRA_ENCODED_DEDUP_COUNT: &str = "multiplex_enc_cnt";

type MultiplexerMap<K, T> = Mutex<HashMap<K, Arc<Multiplexer<K, T>>>>;

type KeyFn<K> = dyn Fn(&RequestContext) -> K + Send + Sync;

/// One attached downstream request
struct Subscriber<T> {
    id: u64,
    consumer: SharedConsumer<T>,
    context: Arc<RequestContext>,

    /// Serializes deliveries so a replayed intermediate never overtakes a
    /// newer fan-out
    delivery: Mutex<()>,
}

struct MultiplexState<T> {
    subscribers: Vec<Arc<Subscriber<T>>>,
    last_intermediate: Option<(Option<T>, ResultStatus)>,
    last_progress: Option<f32>,
    upstream_context: Option<Arc<RequestContext>>,
    closed: bool,
    next_id: u64,
}

/// Upstream context flags derived from the attached subscribers
struct FlagUpdate {
    context: Arc<RequestContext>,
    is_prefetch: bool,
    is_intermediate_result_expected: bool,
    priority: Priority,
}

impl FlagUpdate {
    fn apply(self) {
        self.context.set_is_prefetch(self.is_prefetch);
        self.context
            .set_is_intermediate_result_expected(self.is_intermediate_result_expected);
        self.context.set_priority(self.priority);
    }
}

/// Prefetch only if every subscriber is; intermediates if any wants them;
/// the highest priority wins
fn aggregate_flags<T>(subscribers: &[Arc<Subscriber<T>>]) -> (bool, bool, Priority) {
    let is_prefetch = subscribers.iter().all(|s| s.context.is_prefetch());
    let intermediate = subscribers
        .iter()
        .any(|s| s.context.is_intermediate_result_expected());
    let priority = subscribers
        .iter()
        .map(|s| s.context.priority())
        .fold(Priority::Low, Priority::higher);
    (is_prefetch, intermediate, priority)
}

struct Multiplexer<K, T> {
    key: K,
    dedup_count_key: &'static str,
    map: Weak<MultiplexerMap<K, T>>,
    state: Mutex<MultiplexState<T>>,
}

impl<K, T> Multiplexer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn new(key: K, dedup_count_key: &'static str, map: Weak<MultiplexerMap<K, T>>) -> Self {
        Self {
            key,
            dedup_count_key,
            map,
            state: Mutex::new(MultiplexState {
                subscribers: Vec::new(),
                last_intermediate: None,
                last_progress: None,
                upstream_context: None,
                closed: false,
                next_id: 0,
            }),
        }
    }

    /// Drop this multiplexer from the map; called with the state lock held
    fn remove_from_map(&self) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        let mut map = map.lock();
        let is_current = map
            .get(&self.key)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self));
        if is_current {
            map.remove(&self.key);
        }
    }

    fn flag_update(state: &MultiplexState<T>) -> Option<FlagUpdate> {
        let context = state.upstream_context.as_ref()?;
        if state.subscribers.is_empty() {
            return None;
        }
        let (is_prefetch, is_intermediate_result_expected, priority) =
            aggregate_flags(&state.subscribers);
        Some(FlagUpdate {
            context: Arc::clone(context),
            is_prefetch,
            is_intermediate_result_expected,
            priority,
        })
    }

    /// Attach a consumer; false if the multiplexer already closed
    fn add_consumer(
        self: &Arc<Self>,
        consumer: SharedConsumer<T>,
        context: Arc<RequestContext>,
    ) -> bool {
        let subscriber;
        let replay;
        let progress;
        let update;
        let delivery;
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            subscriber = Arc::new(Subscriber {
                id: state.next_id,
                consumer,
                context: Arc::clone(&context),
                delivery: Mutex::new(()),
            });
            state.next_id += 1;
            state.subscribers.push(Arc::clone(&subscriber));
            replay = state.last_intermediate.clone();
            progress = state.last_progress;
            update = Self::flag_update(&state);
            delivery = subscriber.delivery.lock();
        }

        if let Some(progress) = progress {
            subscriber.consumer.on_progress_update(progress);
        }
        if let Some((result, status)) = replay {
            subscriber.consumer.on_new_result(result, status);
        }
        drop(delivery);

        context.add_callbacks(Arc::new(SubscriberCallbacks {
            multiplexer: Arc::downgrade(self),
            subscriber_id: subscriber.id,
        }));
        if let Some(update) = update {
            update.apply();
        }
        true
    }

    /// Start the shared upstream request, unless every subscriber already
    /// left
    fn start_upstream(self: &Arc<Self>, input: &SharedProducer<T>) {
        let upstream_context = {
            let mut state = self.state.lock();
            if state.closed || state.subscribers.is_empty() {
                return;
            }
            let first = &state.subscribers[0].context;
            let (is_prefetch, intermediate, priority) = aggregate_flags(&state.subscribers);
            let context = Arc::new(
                RequestContext::new(first.id(), first.image_request_arc(), first.listener_arc())
                    .with_lowest_permitted_level(first.lowest_permitted_level())
                    .with_prefetch(is_prefetch)
                    .with_intermediate_result_expected(intermediate)
                    .with_priority(priority),
            );
            state.upstream_context = Some(Arc::clone(&context));
            context
        };

        let forwarding: SharedConsumer<T> = Arc::new(ForwardingConsumer {
            multiplexer: Arc::clone(self),
        });
        input.produce_results(forwarding, upstream_context);
    }

    /// Close the multiplexer and hand back everything still attached
    fn close(
        &self,
        state: &mut MultiplexState<T>,
    ) -> (Vec<Arc<Subscriber<T>>>, Option<Arc<RequestContext>>) {
        state.closed = true;
        state.last_intermediate = None;
        self.remove_from_map();
        (
            std::mem::take(&mut state.subscribers),
            state.upstream_context.take(),
        )
    }

    /// Copy the upstream's extras and the dedup count into each request
    fn propagate_extras(
        &self,
        subscribers: &[Arc<Subscriber<T>>],
        upstream: Option<&RequestContext>,
    ) {
        let extras = upstream.map(RequestContext::extras).unwrap_or_default();
        for subscriber in subscribers {
            for (key, value) in &extras {
                subscriber.context.put_extra(key.clone(), value.clone());
            }
            subscriber
                .context
                .put_extra(self.dedup_count_key, subscribers.len());
        }
    }

    fn on_subscriber_cancelled(&self, subscriber_id: u64) {
        let (removed, upstream_to_cancel, update) = {
            let mut state = self.state.lock();
            let Some(position) = state.subscribers.iter().position(|s| s.id == subscriber_id)
            else {
                return;
            };
            let removed = state.subscribers.remove(position);
            if state.subscribers.is_empty() {
                let (_, upstream) = self.close(&mut state);
                (removed, upstream, None)
            } else {
                (removed, None, Self::flag_update(&state))
            }
        };

        {
            let _delivery = removed.delivery.lock();
            removed.consumer.on_cancellation();
        }
        if let Some(upstream) = upstream_to_cancel {
            debug!(request_id = %upstream.id(), "All multiplexed requests cancelled");
            upstream.cancel();
        }
        if let Some(update) = update {
            update.apply();
        }
    }

    fn on_subscriber_flags_changed(&self) {
        let update = Self::flag_update(&self.state.lock());
        if let Some(update) = update {
            update.apply();
        }
    }
}

/// Registered on each subscriber's context
struct SubscriberCallbacks<K, T> {
    multiplexer: Weak<Multiplexer<K, T>>,
    subscriber_id: u64,
}

impl<K, T> ContextCallbacks for SubscriberCallbacks<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn on_cancellation_requested(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.on_subscriber_cancelled(self.subscriber_id);
        }
    }

    fn on_is_prefetch_changed(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.on_subscriber_flags_changed();
        }
    }

    fn on_is_intermediate_result_expected_changed(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.on_subscriber_flags_changed();
        }
    }

    fn on_priority_changed(&self) {
        if let Some(multiplexer) = self.multiplexer.upgrade() {
            multiplexer.on_subscriber_flags_changed();
        }
    }
}

/// Consumer handed to the shared upstream; fans results out
struct ForwardingConsumer<K, T> {
    multiplexer: Arc<Multiplexer<K, T>>,
}

impl<K, T> ForwardingConsumer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Close and return the subscribers for a terminal event
    fn take_for_terminal(&self) -> Vec<Arc<Subscriber<T>>> {
        let (subscribers, upstream) = {
            let mut state = self.multiplexer.state.lock();
            if state.closed {
                return Vec::new();
            }
            self.multiplexer.close(&mut state)
        };
        self.multiplexer
            .propagate_extras(&subscribers, upstream.as_deref());
        subscribers
    }
}

impl<K, T> Consumer<T> for ForwardingConsumer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn on_new_result(&self, result: Option<T>, status: ResultStatus) {
        let subscribers = if status.is_last() {
            self.take_for_terminal()
        } else {
            let mut state = self.multiplexer.state.lock();
            if state.closed {
                return;
            }
            state.last_intermediate = Some((result.clone(), status));
            state.subscribers.clone()
        };

        for subscriber in subscribers {
            let _delivery = subscriber.delivery.lock();
            subscriber.consumer.on_new_result(result.clone(), status);
        }
    }

    fn on_failure(&self, error: PipelineError) {
        for subscriber in self.take_for_terminal() {
            let _delivery = subscriber.delivery.lock();
            subscriber.consumer.on_failure(error.clone());
        }
    }

    fn on_cancellation(&self) {
        for subscriber in self.take_for_terminal() {
            let _delivery = subscriber.delivery.lock();
            subscriber.consumer.on_cancellation();
        }
    }

    fn on_progress_update(&self, progress: f32) {
        let subscribers = {
            let mut state = self.multiplexer.state.lock();
            if state.closed {
                return;
            }
            state.last_progress = Some(progress);
            state.subscribers.clone()
        };
        for subscriber in subscribers {
            let _delivery = subscriber.delivery.lock();
            subscriber.consumer.on_progress_update(progress);
        }
    }
}

/// Runs one upstream request per key for any number of identical requests
pub struct MultiplexProducer<K, T> {
    name: &'static str,
    dedup_count_key: &'static str,
    key_fn: Box<KeyFn<K>>,
    input: SharedProducer<T>,
    multiplexers: Arc<MultiplexerMap<K, T>>,
}

impl<K, T> MultiplexProducer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        dedup_count_key: &'static str,
        key_fn: impl Fn(&RequestContext) -> K + Send + Sync + 'static,
        input: SharedProducer<T>,
    ) -> Self {
        Self {
            name,
            dedup_count_key,
            key_fn: Box::new(key_fn),
            input,
            multiplexers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys with an upstream request in flight
    pub fn in_flight_count(&self) -> usize {
        self.multiplexers.lock().len()
    }
}

impl<K, T> Producer<T> for MultiplexProducer<K, T>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn produce_results(&self, consumer: SharedConsumer<T>, context: Arc<RequestContext>) {
        let key = (self.key_fn)(&context);
        loop {
            let (multiplexer, created) = {
                let mut map = self.multiplexers.lock();
                match map.get(&key) {
                    Some(existing) => (Arc::clone(existing), false),
                    None => {
                        let multiplexer = Arc::new(Multiplexer::new(
                            key.clone(),
                            self.dedup_count_key,
                            Arc::downgrade(&self.multiplexers),
                        ));
                        map.insert(key.clone(), Arc::clone(&multiplexer));
                        (multiplexer, true)
                    }
                }
            };

            if multiplexer.add_consumer(Arc::clone(&consumer), Arc::clone(&context)) {
                if created {
                    multiplexer.start_upstream(&self.input);
                } else {
                    debug!(
                        request_id = %context.id(),
                        producer = self.name,
                        "Joined in-flight request"
                    );
                }
                return;
            }
        }
    }
}

/// Key of the bitmap multiplexer: bitmap cache key and lowest level
pub type BitmapMultiplexKey = (CacheKey, RequestLevel);

/// Key of the encoded multiplexer: encoded cache key and lowest level
pub type EncodedMultiplexKey = (CacheKey, RequestLevel);

/// Multiplexer in front of decoding, keyed by bitmap cache key
pub fn bitmap_multiplex(
    key_factory: Arc<dyn CacheKeyFactory>,
    input: SharedProducer<BitmapRef>,
) -> MultiplexProducer<BitmapMultiplexKey, BitmapRef> {
    MultiplexProducer::new(
        "BitmapMemoryCacheKeyMultiplexProducer",
        EXTRA_BITMAP_DEDUP_COUNT,
        move |context: &RequestContext| {
            (
                key_factory.bitmap_cache_key(context.image_request()),
                context.lowest_permitted_level(),
            )
        },
        input,
    )
}

/// Multiplexer in front of fetching, keyed by encoded cache key
pub fn encoded_multiplex(
    key_factory: Arc<dyn CacheKeyFactory>,
    input: SharedProducer<EncodedImage>,
) -> MultiplexProducer<EncodedMultiplexKey, EncodedImage> {
    MultiplexProducer::new(
        "EncodedCacheKeyMultiplexProducer",
        EXTRA_ENCODED_DEDUP_COUNT,
        move |context: &RequestContext| {
            (
                key_factory.encoded_cache_key(context.image_request()),
                context.lowest_permitted_level(),
            )
        },
        input,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DefaultCacheKeyFactory;
    use crate::consumer::test_support::{Event, RecordingConsumer};
    use crate::listener::NoopRequestListener;
    use crate::producers::test_support::PendingProducer;
    use crate::request::ImageRequest;

    const URI: &str = "https://images.test/mux.png";

    fn context(id: &str) -> Arc<RequestContext> {
        Arc::new(RequestContext::new(
            id,
            Arc::new(ImageRequest::from_uri(URI).unwrap()),
            Arc::new(NoopRequestListener),
        ))
    }

    fn multiplex(
        upstream: &Arc<PendingProducer<EncodedImage>>,
    ) -> MultiplexProducer<EncodedMultiplexKey, EncodedImage> {
        encoded_multiplex(Arc::new(DefaultCacheKeyFactory), upstream.clone())
    }

    fn sizes(consumer: &RecordingConsumer<EncodedImage>) -> Vec<(Option<usize>, bool)> {
        consumer
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Result(result, status) => {
                    Some((result.as_ref().map(EncodedImage::size), status.is_last()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_identical_requests_share_one_upstream() {
        let upstream = PendingProducer::new();
        let producer = multiplex(&upstream);
        let (first, second) = (RecordingConsumer::new(), RecordingConsumer::new());
        let (first_context, second_context) = (context("a"), context("b"));

        producer.produce_results(first.clone(), first_context.clone());
        producer.produce_results(second.clone(), second_context.clone());
        assert_eq!(upstream.calls(), 1);
        assert_eq!(producer.in_flight_count(), 1);

        let (forwarding, upstream_context) = upstream.call(0);
        assert_eq!(upstream_context.id(), "a");
        upstream_context.put_extra("origin", "network");
        forwarding.on_new_result(Some(EncodedImage::from_vec(vec![0; 5])), ResultStatus::IS_LAST);

        assert_eq!(sizes(&first), vec![(Some(5), true)]);
        assert_eq!(sizes(&second), vec![(Some(5), true)]);
        assert_eq!(producer.in_flight_count(), 0);
        for context in [&first_context, &second_context] {
            assert_eq!(
                context.extra(EXTRA_ENCODED_DEDUP_COUNT),
                Some(serde_json::Value::from(2))
            );
            assert_eq!(
                context.extra("origin"),
                Some(serde_json::Value::from("network"))
            );
        }

        let third = RecordingConsumer::new();
        producer.produce_results(third.clone(), context("c"));
        assert_eq!(upstream.calls(), 2);
        assert!(third.events().is_empty());
    }

    #[test]
    fn test_late_joiner_gets_last_intermediate_and_progress() {
        let upstream = PendingProducer::new();
        let producer = multiplex(&upstream);
        let first = RecordingConsumer::new();
        producer.produce_results(first.clone(), context("a"));

        let (forwarding, _) = upstream.call(0);
        forwarding.on_progress_update(0.4);
        forwarding.on_new_result(Some(EncodedImage::from_vec(vec![0; 2])), ResultStatus::empty());

        let late = RecordingConsumer::new();
        producer.produce_results(late.clone(), context("b"));
        assert!(matches!(late.events()[0], Event::Progress(p) if (p - 0.4).abs() < f32::EPSILON));
        assert_eq!(sizes(&late), vec![(Some(2), false)]);

        forwarding.on_new_result(Some(EncodedImage::from_vec(vec![0; 4])), ResultStatus::IS_LAST);
        assert_eq!(sizes(&late), vec![(Some(2), false), (Some(4), true)]);
        assert_eq!(sizes(&first), vec![(Some(2), false), (Some(4), true)]);
    }

    #[test]
    fn test_cancelling_one_consumer_detaches_only_it() {
        let upstream = PendingProducer::new();
        let producer = multiplex(&upstream);
        let (first, second) = (RecordingConsumer::new(), RecordingConsumer::new());
        let (first_context, second_context) = (context("a"), context("b"));
        producer.produce_results(first.clone(), first_context.clone());
        producer.produce_results(second.clone(), second_context.clone());
        let (forwarding, upstream_context) = upstream.call(0);

        first_context.cancel();
        assert!(matches!(first.events().as_slice(), [Event::Cancellation]));
        assert!(!upstream_context.is_cancelled());

        forwarding.on_new_result(Some(EncodedImage::from_vec(vec![1])), ResultStatus::IS_LAST);
        assert_eq!(sizes(&second), vec![(Some(1), true)]);
        assert_eq!(first.terminal_count(), 1);
        assert_eq!(
            second_context.extra(EXTRA_ENCODED_DEDUP_COUNT),
            Some(serde_json::Value::from(1))
        );
    }

    #[test]
    fn test_cancelling_all_consumers_cancels_upstream() {
        let upstream = PendingProducer::new();
        let producer = multiplex(&upstream);
        let (first, second) = (RecordingConsumer::new(), RecordingConsumer::new());
        let (first_context, second_context) = (context("a"), context("b"));
        producer.produce_results(first.clone(), first_context.clone());
        producer.produce_results(second.clone(), second_context.clone());
        let (forwarding, upstream_context) = upstream.call(0);

        first_context.cancel();
        second_context.cancel();
        assert!(upstream_context.is_cancelled());
        assert_eq!(producer.in_flight_count(), 0);

        forwarding.on_cancellation();
        assert_eq!(first.terminal_count(), 1);
        assert_eq!(second.terminal_count(), 1);
    }

    #[test]
    fn test_upstream_flags_track_subscribers() {
        let upstream = PendingProducer::new();
        let producer = multiplex(&upstream);
        let request = Arc::new(ImageRequest::from_uri(URI).unwrap());
        let low_prefetch = Arc::new(
            RequestContext::new("a", request.clone(), Arc::new(NoopRequestListener))
                .with_priority(Priority::Low)
                .with_prefetch(true)
                .with_intermediate_result_expected(false),
        );
        producer.produce_results(RecordingConsumer::<EncodedImage>::new(), low_prefetch.clone());
        let (_, upstream_context) = upstream.call(0);
        assert!(upstream_context.is_prefetch());
        assert!(!upstream_context.is_intermediate_result_expected());
        assert_eq!(upstream_context.priority(), Priority::Low);

        let high = Arc::new(
            RequestContext::new("b", request, Arc::new(NoopRequestListener))
                .with_priority(Priority::High),
        );
        producer.produce_results(RecordingConsumer::<EncodedImage>::new(), high.clone());
        assert!(!upstream_context.is_prefetch());
        assert!(upstream_context.is_intermediate_result_expected());
        assert_eq!(upstream_context.priority(), Priority::High);

        high.set_priority(Priority::Medium);
        assert_eq!(upstream_context.priority(), Priority::Medium);

        high.cancel();
        assert!(upstream_context.is_prefetch());
        assert_eq!(upstream_context.priority(), Priority::Low);
    }

    #[test]
    fn test_failure_fans_out() {
        let upstream = PendingProducer::new();
        let producer = multiplex(&upstream);
        let (first, second) = (RecordingConsumer::new(), RecordingConsumer::new());
        producer.produce_results(first.clone(), context("a"));
        producer.produce_results(second.clone(), context("b"));

        let (forwarding, _) = upstream.call(0);
        forwarding.on_failure(PipelineError::fetch("test", "boom"));

        for consumer in [&first, &second] {
            assert!(matches!(consumer.events().as_slice(), [Event::Failure(_)]));
        }
        assert_eq!(producer.in_flight_count(), 0);
    }

    #[test]
    fn test_different_levels_do_not_share() {
        let upstream = PendingProducer::new();
        let producer = multiplex(&upstream);
        let request = Arc::new(ImageRequest::from_uri(URI).unwrap());
        let disk_only = Arc::new(
            RequestContext::new("a", request, Arc::new(NoopRequestListener))
                .with_lowest_permitted_level(RequestLevel::DiskCache),
        );

        producer.produce_results(RecordingConsumer::<EncodedImage>::new(), context("full"));
        producer.produce_results(RecordingConsumer::<EncodedImage>::new(), disk_only);
        assert_eq!(upstream.calls(), 2);
        assert_eq!(producer.in_flight_count(), 2);
    }
}
