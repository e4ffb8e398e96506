//! Decode stage: encoded bytes to bitmaps on the decode executor

use crate::consumer::{BaseConsumer, DelegatingConsumer, ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::decoder::ImageDecoder;
use crate::executor::{ExecutorSupplier, JobScheduler};
use crate::image_data::{BitmapRef, EncodedImage, QualityInfo};
use crate::producer::{Producer, SharedProducer};
use crate::producers::stage_extras;
use crate::reference::CloseableRef;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub const EXTRA_IMAGE_FORMAT: &str = "image_format";
pub const EXTRA_BITMAP_SIZE: &str = "bitmap_size";
pub const EXTRA_IS_FINAL: &str = "is_final";
pub const EXTRA_DECODE_TIME: &str = "decode_time";

/// Decodes the latest upstream payload; superseded intermediates are never
/// decoded
pub struct DecodeProducer {
    decoder: Arc<dyn ImageDecoder>,
    executors: ExecutorSupplier,
    input: SharedProducer<EncodedImage>,
}

impl DecodeProducer {
    pub const NAME: &'static str = "DecodeProducer";

    pub fn new(
        decoder: Arc<dyn ImageDecoder>,
        executors: ExecutorSupplier,
        input: SharedProducer<EncodedImage>,
    ) -> Self {
        Self {
            decoder,
            executors,
            input,
        }
    }

    fn decode(
        decoder: &dyn ImageDecoder,
        encoded: EncodedImage,
        status: ResultStatus,
        downstream: &SharedConsumer<BitmapRef>,
        context: &RequestContext,
    ) {
        if context.is_cancelled() {
            downstream.on_cancellation();
            return;
        }

        let listener = context.listener();
        listener.on_producer_start(context, Self::NAME);
        let is_last = status.is_last();
        let quality = if is_last {
            QualityInfo::FULL_QUALITY
        } else {
            QualityInfo::partial(u32::try_from(encoded.size()).unwrap_or(u32::MAX))
        };

        let started = Instant::now();
        let options = context.image_request().decode_options();
        let decoded = decoder.decode(&encoded, encoded.size(), quality, &options);
        let format = encoded.format();
        drop(encoded);

        match decoded {
            Ok(image) => {
                let extras = stage_extras(
                    context,
                    Self::NAME,
                    &[
                        (EXTRA_IMAGE_FORMAT, format!("{format:?}")),
                        (
                            EXTRA_BITMAP_SIZE,
                            format!("{}x{}", image.width(), image.height()),
                        ),
                        (EXTRA_IS_FINAL, is_last.to_string()),
                        (
                            EXTRA_DECODE_TIME,
                            started.elapsed().as_millis().to_string(),
                        ),
                    ],
                );
                listener.on_producer_finish_with_success(context, Self::NAME, extras.as_ref());
                if context.is_cancelled() {
                    downstream.on_cancellation();
                    return;
                }
                if is_last {
                    downstream.on_progress_update(1.0);
                }
                downstream.on_new_result(Some(CloseableRef::of(image)), status);
            }
            Err(error) => {
                listener.on_producer_finish_with_failure(context, Self::NAME, &error, None);
                if is_last {
                    warn!(request_id = %context.id(), "Decode failed: {}", error);
                    downstream.on_failure(error.with_stage(Self::NAME));
                } else {
                    debug!(request_id = %context.id(), "Skipping undecodable intermediate: {}", error);
                }
            }
        }
    }
}

impl Producer<BitmapRef> for DecodeProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<BitmapRef>, context: Arc<RequestContext>) {
        let downstream = BaseConsumer::shared(consumer);
        let job_downstream = Arc::clone(&downstream);
        let job_context = Arc::clone(&context);
        let decoder = Arc::clone(&self.decoder);
        let scheduler = JobScheduler::new(
            self.executors.decode_handle().clone(),
            move |encoded: EncodedImage, status| {
                Self::decode(decoder.as_ref(), encoded, status, &job_downstream, &job_context);
            },
        );

        let progressive = context.image_request().progressive_rendering_enabled();
        let handler_context = Arc::clone(&context);
        let wrapped = DelegatingConsumer::new(
            downstream,
            Self::NAME,
            move |downstream, result: Option<EncodedImage>, status: ResultStatus| {
                let is_last = status.is_last();
                match result.filter(EncodedImage::is_valid) {
                    Some(encoded) => {
                        let wanted = is_last
                            || (progressive && handler_context.is_intermediate_result_expected());
                        if wanted {
                            scheduler.update_job(encoded, status);
                            scheduler.schedule_job();
                        }
                    }
                    None if is_last => {
                        scheduler.clear_job();
                        downstream.on_new_result(None, status);
                    }
                    None => {}
                }
                Ok(())
            },
        );
        self.input.produce_results(wrapped.shared(), context);
    }
}
