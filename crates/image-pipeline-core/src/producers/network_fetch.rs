//! Fetch stage: streams the source bytes from a [`NetworkFetcher`]

use crate::consumer::{ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::error::Result;
use crate::executor::ExecutorSupplier;
use crate::fetch::{FetchResponse, NetworkFetcher};
use crate::image_data::EncodedImage;
use crate::producer::Producer;
use crate::producers::stage_extras;
use crate::request::BytesRange;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Extras keys reported on success
pub const EXTRA_QUEUE_TIME: &str = "queue_time";
pub const EXTRA_FETCH_TIME: &str = "fetch_time";
pub const EXTRA_TOTAL_TIME: &str = "total_time";
pub const EXTRA_IMAGE_SIZE: &str = "image_size";

/// Download length at which progress of a body without a known length
/// reaches ~63%
const UNKNOWN_LENGTH_PROGRESS_SCALE: f32 = 50_000.0;

struct FetchedBody {
    data: Vec<u8>,
    partial_range: Option<BytesRange>,
    fetch_started: Instant,
}

/// Ultimate producer of a sequence: nothing upstream of it
pub struct NetworkFetchProducer {
    fetcher: Arc<dyn NetworkFetcher>,
    executors: ExecutorSupplier,
    partial_result_interval: Duration,
}

impl NetworkFetchProducer {
    pub const NAME: &'static str = "NetworkFetchProducer";

    pub fn new(fetcher: Arc<dyn NetworkFetcher>, executors: ExecutorSupplier) -> Self {
        Self {
            fetcher,
            executors,
            partial_result_interval: Duration::from_millis(100),
        }
    }

    /// Minimum spacing between intermediate results
    pub fn with_partial_result_interval(mut self, interval: Duration) -> Self {
        self.partial_result_interval = interval;
        self
    }

    fn progress(downloaded: usize, total: Option<u64>) -> f32 {
        match total {
            Some(total) if total > 0 => (downloaded as f32 / total as f32).min(1.0),
            _ => 1.0 - (-(downloaded as f32) / UNKNOWN_LENGTH_PROGRESS_SCALE).exp(),
        }
    }

    async fn fetch(
        fetcher: Arc<dyn NetworkFetcher>,
        context: &RequestContext,
        consumer: &SharedConsumer<EncodedImage>,
        interval: Duration,
    ) -> Result<FetchedBody> {
        let request = context.image_request();
        let fetch_started = Instant::now();
        let FetchResponse {
            mut body,
            content_length,
            partial_range,
        } = fetcher
            .fetch(request.source_uri(), request.bytes_range())
            .await?;

        let propagate_intermediate = request.progressive_rendering_enabled();
        let capacity = content_length.unwrap_or(0).min(16 * 1024 * 1024) as usize;
        let mut data = Vec::with_capacity(capacity);
        let mut last_intermediate = Instant::now();

        while let Some(chunk) = body.next_chunk().await? {
            data.extend_from_slice(&chunk);
            consumer.on_progress_update(Self::progress(data.len(), content_length));

            let done = content_length.is_some_and(|total| data.len() as u64 >= total);
            if !done
                && propagate_intermediate
                && context.is_intermediate_result_expected()
                && last_intermediate.elapsed() >= interval
            {
                last_intermediate = Instant::now();
                context
                    .listener()
                    .on_producer_event(context, Self::NAME, "intermediate_result");
                consumer.on_new_result(
                    Some(EncodedImage::from_vec(data.clone())),
                    ResultStatus::empty(),
                );
            }
        }

        Ok(FetchedBody {
            data,
            partial_range,
            fetch_started,
        })
    }

    fn deliver_final(
        context: &RequestContext,
        consumer: &SharedConsumer<EncodedImage>,
        fetched: FetchedBody,
        queued_at: Instant,
    ) {
        let finished = Instant::now();
        let extras = stage_extras(
            context,
            Self::NAME,
            &[
                (
                    EXTRA_QUEUE_TIME,
                    (fetched.fetch_started - queued_at).as_millis().to_string(),
                ),
                (
                    EXTRA_FETCH_TIME,
                    (finished - fetched.fetch_started).as_millis().to_string(),
                ),
                (
                    EXTRA_TOTAL_TIME,
                    (finished - queued_at).as_millis().to_string(),
                ),
                (EXTRA_IMAGE_SIZE, fetched.data.len().to_string()),
            ],
        );
        debug!(
            request_id = %context.id(),
            bytes = fetched.data.len(),
            partial = fetched.partial_range.is_some(),
            "Fetch complete"
        );

        let listener = context.listener();
        listener.on_producer_finish_with_success(context, Self::NAME, extras.as_ref());
        listener.on_ultimate_producer_reached(context, Self::NAME, true);
        context.put_origin_extra("network", None);

        let mut status = ResultStatus::IS_LAST;
        let mut encoded = EncodedImage::from_vec(fetched.data);
        if let Some(range) = fetched.partial_range {
            status |= ResultStatus::IS_PARTIAL_RESULT;
            encoded = encoded.with_bytes_range(range);
        }
        consumer.on_new_result(Some(encoded), status);
    }
}

impl Producer<EncodedImage> for NetworkFetchProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<EncodedImage>, context: Arc<RequestContext>) {
        context.listener().on_producer_start(&context, Self::NAME);
        let queued_at = Instant::now();
        let fetcher = Arc::clone(&self.fetcher);
        let interval = self.partial_result_interval;

        self.executors.spawn_io(async move {
            let token = context.cancellation_token();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                fetched = Self::fetch(fetcher, &context, &consumer, interval) => Some(fetched),
            };

            let listener = context.listener();
            match outcome {
                None => {
                    debug!(request_id = %context.id(), "Fetch cancelled");
                    listener.on_producer_finish_with_cancellation(&context, Self::NAME, None);
                    consumer.on_cancellation();
                }
                Some(Ok(fetched)) => {
                    Self::deliver_final(&context, &consumer, fetched, queued_at);
                }
                Some(Err(error)) => {
                    warn!(
                        request_id = %context.id(),
                        uri = %context.image_request().source_uri(),
                        "Fetch failed: {}",
                        error
                    );
                    listener.on_producer_finish_with_failure(&context, Self::NAME, &error, None);
                    listener.on_ultimate_producer_reached(&context, Self::NAME, false);
                    consumer.on_failure(error.with_stage(Self::NAME));
                }
            }
        });
    }
}
