//! Moves the rest of a sequence onto the background executor

use crate::consumer::SharedConsumer;
use crate::context::RequestContext;
use crate::executor::ExecutorSupplier;
use crate::producer::{Producer, SharedProducer};
use std::sync::Arc;
use tracing::debug;

/// Starts its upstream from a background task so the caller of
/// `produce_results` never runs cache lookups or fetch setup inline
pub struct ThreadHandoffProducer<T> {
    input: SharedProducer<T>,
    executors: ExecutorSupplier,
}

impl<T> ThreadHandoffProducer<T> {
    pub const NAME: &'static str = "BackgroundThreadHandoffProducer";

    pub fn new(input: SharedProducer<T>, executors: ExecutorSupplier) -> Self {
        Self { input, executors }
    }
}

impl<T: Send + 'static> Producer<T> for ThreadHandoffProducer<T> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<T>, context: Arc<RequestContext>) {
        context.listener().on_producer_start(&context, Self::NAME);
        let input = Arc::clone(&self.input);
        self.executors.spawn_background(async move {
            if context.is_cancelled() {
                debug!(request_id = %context.id(), "Cancelled before hand-off ran");
                context
                    .listener()
                    .on_producer_finish_with_cancellation(&context, Self::NAME, None);
                consumer.on_cancellation();
                return;
            }
            context
                .listener()
                .on_producer_finish_with_success(&context, Self::NAME, None);
            input.produce_results(consumer, context);
        });
    }
}
