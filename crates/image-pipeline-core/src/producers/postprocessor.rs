//! Postprocessing stage

use crate::consumer::{BaseConsumer, DelegatingConsumer, ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::error::PipelineError;
use crate::executor::{ExecutorSupplier, JobScheduler};
use crate::image_data::BitmapRef;
use crate::postprocess::Postprocessor;
use crate::producer::{Producer, SharedProducer};
use crate::producers::stage_extras;
use crate::reference::CloseableRef;
use std::sync::Arc;
use tracing::warn;

/// Extras key naming the postprocessor that ran
pub const EXTRA_POSTPROCESSOR: &str = "postprocessor";

/// Applies the request's postprocessor to upstream bitmaps on the
/// background executor. Requests without a postprocessor pass through.
pub struct PostprocessorProducer {
    executors: ExecutorSupplier,
    input: SharedProducer<BitmapRef>,
}

impl PostprocessorProducer {
    pub const NAME: &'static str = "PostprocessorProducer";

    pub fn new(executors: ExecutorSupplier, input: SharedProducer<BitmapRef>) -> Self {
        Self { executors, input }
    }

    fn postprocess(
        postprocessor: &dyn Postprocessor,
        source: BitmapRef,
        status: ResultStatus,
        downstream: &SharedConsumer<BitmapRef>,
        context: &RequestContext,
    ) {
        let listener = context.listener();
        listener.on_producer_start(context, Self::NAME);
        if context.is_cancelled() {
            listener.on_producer_finish_with_cancellation(context, Self::NAME, None);
            downstream.on_cancellation();
            return;
        }
        let extras = stage_extras(
            context,
            Self::NAME,
            &[(EXTRA_POSTPROCESSOR, postprocessor.name().to_string())],
        );

        let processed = source.get().and_then(|image| postprocessor.process(image));
        drop(source);
        match processed {
            Ok(image) => {
                listener.on_producer_finish_with_success(context, Self::NAME, extras.as_ref());
                downstream.on_new_result(Some(CloseableRef::of(image)), status);
            }
            Err(error) => {
                let error = match error {
                    postprocess @ PipelineError::Postprocess { .. } => postprocess,
                    other => PipelineError::Postprocess {
                        name: postprocessor.name().to_string(),
                        message: other.to_string(),
                    },
                };
                warn!(
                    request_id = %context.id(),
                    postprocessor = postprocessor.name(),
                    "Postprocessing failed: {}",
                    error
                );
                listener.on_producer_finish_with_failure(context, Self::NAME, &error, extras.as_ref());
                downstream.on_failure(error.with_stage(Self::NAME));
            }
        }
    }
}

impl Producer<BitmapRef> for PostprocessorProducer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<BitmapRef>, context: Arc<RequestContext>) {
        let Some(postprocessor) = context.image_request().postprocessor().cloned() else {
            self.input.produce_results(consumer, context);
            return;
        };

        // jobs deliver asynchronously, so the guard has to sit below them
        let downstream = BaseConsumer::shared(consumer);
        let job_downstream = Arc::clone(&downstream);
        let job_context = Arc::clone(&context);
        let scheduler = JobScheduler::new(
            self.executors.background_handle().clone(),
            move |source: BitmapRef, status| {
                Self::postprocess(
                    postprocessor.as_ref(),
                    source,
                    status,
                    &job_downstream,
                    &job_context,
                );
            },
        );

        let wrapped = DelegatingConsumer::new(
            downstream,
            Self::NAME,
            move |downstream, result: Option<BitmapRef>, status: ResultStatus| {
                match result.filter(CloseableRef::is_valid) {
                    Some(source) => {
                        scheduler.update_job(source, status);
                        scheduler.schedule_job();
                    }
                    None if status.is_last() => {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::test_support::{Event, RecordingConsumer};
    use crate::error::Result;
    use crate::image_data::{DecodedImage, QualityInfo};
    use crate::postprocess::GrayscalePostprocessor;
    use crate::producers::test_support::{recorded_context, ScriptedProducer};
    use crate::request::{ImageRequest, ImageRequestBuilder};

    const URI: &str = "https://images.test/post.png";

    struct FailingPostprocessor;

    impl Postprocessor for FailingPostprocessor {
        fn name(&self) -> &str {
            "failing"
        }

        fn process(&self, _source: &DecodedImage) -> Result<DecodedImage> {
            Err(PipelineError::InvalidRequest("unsupported".into()))
        }
    }

    fn red(width: u32) -> BitmapRef {
        let bitmap = image::RgbaImage::from_pixel(width, 1, image::Rgba([255, 0, 0, 255]));
        CloseableRef::of(DecodedImage::new(bitmap, QualityInfo::FULL_QUALITY))
    }

    fn request(postprocessor: Arc<dyn Postprocessor>) -> ImageRequest {
        ImageRequestBuilder::new(URI)
            .with_postprocessor(postprocessor)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_applies_postprocessor() {
        let upstream = ScriptedProducer::new(vec![(Some(red(2)), ResultStatus::IS_LAST)]);
        let producer = PostprocessorProducer::new(ExecutorSupplier::current().unwrap(), upstream);
        let consumer = RecordingConsumer::new();
        let (context, listener) = recorded_context(request(Arc::new(GrayscalePostprocessor)));

        producer.produce_results(consumer.clone(), context);
        consumer.wait().await;

        let result = consumer.last_result().unwrap();
        let pixel = result.get().unwrap().bitmap().get_pixel(0, 0).0;
        assert_eq!(pixel, [76, 76, 76, 255]);
        assert!(listener
            .events()
            .contains(&"success:PostprocessorProducer:postprocessor".to_string()));
    }

    #[tokio::test]
    async fn test_failure_becomes_postprocess_error() {
        let upstream = ScriptedProducer::new(vec![(Some(red(2)), ResultStatus::IS_LAST)]);
        let producer = PostprocessorProducer::new(ExecutorSupplier::current().unwrap(), upstream);
        let consumer = RecordingConsumer::new();
        let (context, _) = recorded_context(request(Arc::new(FailingPostprocessor)));

        producer.produce_results(consumer.clone(), context);
        consumer.wait().await;

        assert_eq!(consumer.terminal_count(), 1);
        match consumer.events().last() {
            Some(Event::Failure(error)) => {
                assert_eq!(error.stage(), Some(PostprocessorProducer::NAME));
                assert!(matches!(error.root(), PipelineError::Postprocess { name, .. } if name == "failing"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_request_ends_with_cancellation() {
        let upstream = ScriptedProducer::new(vec![(Some(red(2)), ResultStatus::IS_LAST)]);
        let producer = PostprocessorProducer::new(ExecutorSupplier::current().unwrap(), upstream);
        let consumer = RecordingConsumer::new();
        let (context, listener) = recorded_context(request(Arc::new(GrayscalePostprocessor)));
        context.cancel();

        producer.produce_results(consumer.clone(), context);
        consumer.wait().await;

        assert!(matches!(consumer.events().as_slice(), [Event::Cancellation]));
        assert!(listener
            .events()
            .contains(&"cancellation:PostprocessorProducer".to_string()));
    }

    #[tokio::test]
    async fn test_without_postprocessor_passes_through() {
        let source = red(3);
        let upstream = ScriptedProducer::new(vec![(Some(source.clone()), ResultStatus::IS_LAST)]);
        let producer = PostprocessorProducer::new(ExecutorSupplier::current().unwrap(), upstream);
        let consumer = RecordingConsumer::new();
        let (context, _) = recorded_context(ImageRequest::from_uri(URI).unwrap());

        producer.produce_results(consumer.clone(), context);

        assert!(consumer.last_result().unwrap().shares_value_with(&source));
    }
}
