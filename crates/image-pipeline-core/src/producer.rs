//! Pipeline stage interface

use crate::consumer::SharedConsumer;
use crate::context::RequestContext;
use std::sync::Arc;

/// One asynchronous stage of the pipeline.
///
/// `produce_results` returns immediately. Results are delivered later to
/// `consumer` from whatever task the stage runs on: zero or more non-last
/// results, then exactly one terminal event. A stage stops delivering once
/// the context is cancelled and reports `on_cancellation` instead.
pub trait Producer<T>: Send + Sync {
    /// Name reported to request listeners
    fn name(&self) -> &'static str;

    fn produce_results(&self, consumer: SharedConsumer<T>, context: Arc<RequestContext>);
}

/// Shared handle to a stage
pub type SharedProducer<T> = Arc<dyn Producer<T>>;
