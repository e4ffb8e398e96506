//! Request and stage instrumentation

use crate::context::RequestContext;
use crate::error::PipelineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// String extras reported by a stage when it finishes
pub type StageExtras = HashMap<String, String>;

/// Observer of request lifecycle and per-stage events.
///
/// Every method has a no-op default. Implementations must not block.
#[allow(unused_variables)]
pub trait RequestListener: Send + Sync {
    fn on_request_start(&self, context: &RequestContext) {}

    fn on_request_success(&self, context: &RequestContext) {}

    fn on_request_failure(&self, context: &RequestContext, error: &PipelineError) {}

    fn on_request_cancellation(&self, context: &RequestContext) {}

    fn on_producer_start(&self, context: &RequestContext, producer: &str) {}

    fn on_producer_event(&self, context: &RequestContext, producer: &str, event: &str) {}

    fn on_producer_finish_with_success(
        &self,
        context: &RequestContext,
        producer: &str,
        extras: Option<&StageExtras>,
    ) {
    }

    fn on_producer_finish_with_failure(
        &self,
        context: &RequestContext,
        producer: &str,
        error: &PipelineError,
        extras: Option<&StageExtras>,
    ) {
    }

    fn on_producer_finish_with_cancellation(
        &self,
        context: &RequestContext,
        producer: &str,
        extras: Option<&StageExtras>,
    ) {
    }

    /// The stage that served the request from its own data (cache hit or
    /// fetch) was reached
    fn on_ultimate_producer_reached(
        &self,
        context: &RequestContext,
        producer: &str,
        successful: bool,
    ) {
    }

    /// Whether `producer` should build its extras map for this request
    fn requires_extra_map(&self, context: &RequestContext, producer: &str) -> bool {
        false
    }
}

/// Listener that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRequestListener;

impl RequestListener for NoopRequestListener {}

/// Fans events out to several listeners.
///
/// A panicking listener is logged and skipped; it never reaches the stage
/// that emitted the event.
#[derive(Default, Clone)]
pub struct ForwardingRequestListener {
    listeners: Vec<Arc<dyn RequestListener>>,
}

impl ForwardingRequestListener {
    pub fn new(listeners: Vec<Arc<dyn RequestListener>>) -> Self {
        Self { listeners }
    }

    pub fn add(&mut self, listener: Arc<dyn RequestListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn each(&self, event: &str, f: impl Fn(&dyn RequestListener)) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                error!("Request listener panicked in {}", event);
            }
        }
    }
}

impl RequestListener for ForwardingRequestListener {
    fn on_request_start(&self, context: &RequestContext) {
        self.each("on_request_start", |l| l.on_request_start(context));
    }

    fn on_request_success(&self, context: &RequestContext) {
        self.each("on_request_success", |l| l.on_request_success(context));
    }

    fn on_request_failure(&self, context: &RequestContext, error: &PipelineError) {
        self.each("on_request_failure", |l| l.on_request_failure(context, error));
    }

    fn on_request_cancellation(&self, context: &RequestContext) {
        self.each("on_request_cancellation", |l| {
            l.on_request_cancellation(context)
        });
    }

    fn on_producer_start(&self, context: &RequestContext, producer: &str) {
        self.each("on_producer_start", |l| l.on_producer_start(context, producer));
    }

    fn on_producer_event(&self, context: &RequestContext, producer: &str, event: &str) {
        self.each("on_producer_event", |l| {
            l.on_producer_event(context, producer, event)
        });
    }

    fn on_producer_finish_with_success(
        &self,
        context: &RequestContext,
        producer: &str,
        extras: Option<&StageExtras>,
    ) {
        self.each("on_producer_finish_with_success", |l| {
            l.on_producer_finish_with_success(context, producer, extras)
        });
    }

    fn on_producer_finish_with_failure(
        &self,
        context: &RequestContext,
        producer: &str,
        error: &PipelineError,
        extras: Option<&StageExtras>,
    ) {
        self.each("on_producer_finish_with_failure", |l| {
            l.on_producer_finish_with_failure(context, producer, error, extras)
        });
    }

    fn on_producer_finish_with_cancellation(
        &self,
        context: &RequestContext,
        producer: &str,
        extras: Option<&StageExtras>,
    ) {
        self.each("on_producer_finish_with_cancellation", |l| {
            l.on_producer_finish_with_cancellation(context, producer, extras)
        });
    }

    fn on_ultimate_producer_reached(
        &self,
        context: &RequestContext,
        producer: &str,
        successful: bool,
    ) {
        self.each("on_ultimate_producer_reached", |l| {
            l.on_ultimate_producer_reached(context, producer, successful)
        });
    }

    fn requires_extra_map(&self, context: &RequestContext, producer: &str) -> bool {
        self.listeners.iter().any(|l| {
            catch_unwind(AssertUnwindSafe(|| l.requires_extra_map(context, producer)))
                .unwrap_or(false)
        })
    }
}

/// Logs request and stage timings through `tracing`
#[derive(Default)]
pub struct TracingRequestListener {
    started: Mutex<HashMap<(String, String), Instant>>,
}

impl TracingRequestListener {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, request_id: &str, producer: &str) {
        self.started
            .lock()
            .insert((request_id.to_string(), producer.to_string()), Instant::now());
    }

    fn elapsed_ms(&self, request_id: &str, producer: &str) -> Option<u128> {
        self.started
            .lock()
            .remove(&(request_id.to_string(), producer.to_string()))
            .map(|start| start.elapsed().as_millis())
    }
}

const REQUEST: &str = "<request>";

impl RequestListener for TracingRequestListener {
    fn on_request_start(&self, context: &RequestContext) {
        self.start(context.id(), REQUEST);
        info!(
            request_id = %context.id(),
            uri = %context.image_request().source_uri(),
            prefetch = context.is_prefetch(),
            "Request started"
        );
    }

    fn on_request_success(&self, context: &RequestContext) {
        let elapsed = self.elapsed_ms(context.id(), REQUEST);
        info!(request_id = %context.id(), elapsed_ms = ?elapsed, "Request succeeded");
    }

    fn on_request_failure(&self, context: &RequestContext, error: &PipelineError) {
        let elapsed = self.elapsed_ms(context.id(), REQUEST);
        warn!(request_id = %context.id(), elapsed_ms = ?elapsed, "Request failed: {}", error);
    }

    fn on_request_cancellation(&self, context: &RequestContext) {
        let elapsed = self.elapsed_ms(context.id(), REQUEST);
        info!(request_id = %context.id(), elapsed_ms = ?elapsed, "Request cancelled");
    }

    fn on_producer_start(&self, context: &RequestContext, producer: &str) {
        self.start(context.id(), producer);
        debug!(request_id = %context.id(), producer, "Stage started");
    }

    fn on_producer_event(&self, context: &RequestContext, producer: &str, event: &str) {
        debug!(request_id = %context.id(), producer, event, "Stage event");
    }

    fn on_producer_finish_with_success(
        &self,
        context: &RequestContext,
        producer: &str,
        extras: Option<&StageExtras>,
    ) {
        let elapsed = self.elapsed_ms(context.id(), producer);
        debug!(
            request_id = %context.id(),
            producer,
            elapsed_ms = ?elapsed,
            extras = ?extras,
            "Stage finished"
        );
    }

    fn on_producer_finish_with_failure(
        &self,
        context: &RequestContext,
        producer: &str,
        error: &PipelineError,
        extras: Option<&StageExtras>,
    ) {
        let elapsed = self.elapsed_ms(context.id(), producer);
        warn!(
            request_id = %context.id(),
            producer,
            elapsed_ms = ?elapsed,
            extras = ?extras,
            "Stage failed: {}",
            error
        );
    }

    fn on_producer_finish_with_cancellation(
        &self,
        context: &RequestContext,
        producer: &str,
        extras: Option<&StageExtras>,
    ) {
        let elapsed = self.elapsed_ms(context.id(), producer);
        debug!(
            request_id = %context.id(),
            producer,
            elapsed_ms = ?elapsed,
            extras = ?extras,
            "Stage cancelled"
        );
    }

    fn on_ultimate_producer_reached(
        &self,
        context: &RequestContext,
        producer: &str,
        successful: bool,
    ) {
        debug!(request_id = %context.id(), producer, successful, "Ultimate stage reached");
    }

    fn requires_extra_map(&self, _context: &RequestContext, _producer: &str) -> bool {
        true
    }
}
