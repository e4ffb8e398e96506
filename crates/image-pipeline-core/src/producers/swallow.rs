//! Result-discarding stage used by prefetch sequences

use crate::consumer::{DelegatingConsumer, ResultStatus, SharedConsumer};
use crate::context::RequestContext;
use crate::producer::{Producer, SharedProducer};
use std::sync::Arc;

/// Runs its upstream for side effects only (cache population) and reports
/// completion as `None` + `IS_LAST`
pub struct SwallowResultProducer<T> {
    input: SharedProducer<T>,
}

impl<T> SwallowResultProducer<T> {
    pub const NAME: &'static str = "SwallowResultProducer";

    pub fn new(input: SharedProducer<T>) -> Self {
        Self { input }
    }
}

impl<T: Send + 'static> Producer<()> for SwallowResultProducer<T> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn produce_results(&self, consumer: SharedConsumer<()>, context: Arc<RequestContext>) {
        let wrapped = DelegatingConsumer::new(
            consumer,
            Self::NAME,
            |downstream, result: Option<T>, status: ResultStatus| {
                drop(result);
                if status.is_last() {
                    downstream.on_new_result(None, status);
                }
                Ok(())
            },
        );
        self.input.produce_results(wrapped.shared(), context);
    }
}
