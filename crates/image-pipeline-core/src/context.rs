//! Per-request state shared by every stage of a pipeline
//!
//! The context is created once per request and handed to each stage by
//! `Arc`. It never owns a stage; stages register [`ContextCallbacks`] to
//! hear about cancellation and priority changes.

use crate::listener::RequestListener;
use crate::request::{ImageRequest, Priority, RequestLevel};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Extras key for the stage that served the result
pub const EXTRA_ORIGIN: &str = "origin";

/// Extras key for the cache or fetch variant within the origin
pub const EXTRA_ORIGIN_SUBCATEGORY: &str = "origin_sub";

/// Notifications a stage can subscribe to
#[allow(unused_variables)]
pub trait ContextCallbacks: Send + Sync {
    fn on_cancellation_requested(&self) {}

    fn on_is_prefetch_changed(&self) {}

    fn on_is_intermediate_result_expected_changed(&self) {}

    fn on_priority_changed(&self) {}
}

struct ContextState {
    priority: Priority,
    is_prefetch: bool,
    is_intermediate_result_expected: bool,
    cancelled: bool,
    callbacks: Vec<Arc<dyn ContextCallbacks>>,
    extras: HashMap<String, Value>,
}

/// Shared request state: identity, flags, cancellation and extras
pub struct RequestContext {
    id: String,
    request: Arc<ImageRequest>,
    listener: Arc<dyn RequestListener>,
    lowest_permitted_level: RequestLevel,
    cancellation: CancellationToken,
    state: Mutex<ContextState>,
}

impl RequestContext {
    /// Context using the request's own priority and lowest level
    pub fn new(
        id: impl Into<String>,
        request: Arc<ImageRequest>,
        listener: Arc<dyn RequestListener>,
    ) -> Self {
        let priority = request.priority();
        let lowest_permitted_level = request.lowest_permitted_level();
        Self {
            id: id.into(),
            request,
            listener,
            lowest_permitted_level,
            cancellation: CancellationToken::new(),
            state: Mutex::new(ContextState {
                priority,
                is_prefetch: false,
                is_intermediate_result_expected: true,
                cancelled: false,
                callbacks: Vec::new(),
                extras: HashMap::new(),
            }),
        }
    }

    pub fn with_lowest_permitted_level(mut self, level: RequestLevel) -> Self {
        self.lowest_permitted_level = level;
        self
    }

    pub fn with_prefetch(self, is_prefetch: bool) -> Self {
        self.state.lock().is_prefetch = is_prefetch;
        self
    }

    pub fn with_intermediate_result_expected(self, expected: bool) -> Self {
        self.state.lock().is_intermediate_result_expected = expected;
        self
    }

    pub fn with_priority(self, priority: Priority) -> Self {
        self.state.lock().priority = priority;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image_request(&self) -> &ImageRequest {
        &self.request
    }

    pub fn image_request_arc(&self) -> Arc<ImageRequest> {
        Arc::clone(&self.request)
    }

    pub fn listener(&self) -> &dyn RequestListener {
        self.listener.as_ref()
    }

    pub fn listener_arc(&self) -> Arc<dyn RequestListener> {
        Arc::clone(&self.listener)
    }

    pub fn lowest_permitted_level(&self) -> RequestLevel {
        self.lowest_permitted_level
    }

    pub fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    pub fn is_prefetch(&self) -> bool {
        self.state.lock().is_prefetch
    }

    pub fn is_intermediate_result_expected(&self) -> bool {
        self.state.lock().is_intermediate_result_expected
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Token cancelled together with this context, for async stages
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Cancel the request. Idempotent; callbacks run once, on the calling
    /// thread, after the context lock is released.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.callbacks.clone()
        };
        self.cancellation.cancel();
        for callback in callbacks {
            callback.on_cancellation_requested();
        }
    }

    /// Register callbacks; if already cancelled, the cancellation callback
    /// fires immediately
    pub fn add_callbacks(&self, callbacks: Arc<dyn ContextCallbacks>) {
        let cancelled = {
            let mut state = self.state.lock();
            state.callbacks.push(Arc::clone(&callbacks));
            state.cancelled
        };
        if cancelled {
            callbacks.on_cancellation_requested();
        }
    }

    /// Returns whether the value changed
    pub fn set_priority(&self, priority: Priority) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.priority == priority {
                return false;
            }
            state.priority = priority;
            state.callbacks.clone()
        };
        for callback in callbacks {
            callback.on_priority_changed();
        }
        true
    }

    pub fn set_is_prefetch(&self, is_prefetch: bool) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.is_prefetch == is_prefetch {
                return false;
            }
            state.is_prefetch = is_prefetch;
            state.callbacks.clone()
        };
        for callback in callbacks {
            callback.on_is_prefetch_changed();
        }
        true
    }

    pub fn set_is_intermediate_result_expected(&self, expected: bool) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            if state.is_intermediate_result_expected == expected {
                return false;
            }
            state.is_intermediate_result_expected = expected;
            state.callbacks.clone()
        };
        for callback in callbacks {
            callback.on_is_intermediate_result_expected_changed();
        }
        true
    }

    pub fn put_extra(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.lock().extras.insert(key.into(), value.into());
    }

    pub fn extra(&self, key: &str) -> Option<Value> {
        self.state.lock().extras.get(key).cloned()
    }

    pub fn extras(&self) -> HashMap<String, Value> {
        self.state.lock().extras.clone()
    }

    /// Record which stage served the result
    pub fn put_origin_extra(&self, origin: &str, subcategory: Option<&str>) {
        let mut state = self.state.lock();
        state
            .extras
            .insert(EXTRA_ORIGIN.to_string(), Value::from(origin));
        if let Some(sub) = subcategory {
            state
                .extras
                .insert(EXTRA_ORIGIN_SUBCATEGORY.to_string(), Value::from(sub));
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("uri", &self.request.source_uri())
            .field("priority", &state.priority)
            .field("is_prefetch", &state.is_prefetch)
            .field("cancelled", &state.cancelled)
            .field("lowest_permitted_level", &self.lowest_permitted_level)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
