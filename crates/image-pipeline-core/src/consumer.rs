//! Push-based result delivery between pipeline stages
//!
//! A stage delivers zero or more non-last results followed by exactly one
//! terminal event: a result flagged [`ResultStatus::IS_LAST`], a failure, or
//! a cancellation. [`BaseConsumer`] and [`DelegatingConsumer`] enforce that
//! nothing reaches a consumer after its terminal event.

use crate::error::{PipelineError, Result};
use bitflags::bitflags;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

bitflags! {
    /// Flags attached to every delivered result
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResultStatus: u8 {
        /// Final result; nothing follows it
        const IS_LAST = 1;
        /// Encoded result that must not be stored in the encoded caches
        const DO_NOT_CACHE_ENCODED = 1 << 1;
        /// Temporary stand-in for the real image
        const IS_PLACEHOLDER = 1 << 2;
        /// Payload covers only part of the requested bytes
        const IS_PARTIAL_RESULT = 1 << 3;
        /// Resize and rotation were already applied
        const IS_RESIZING_DONE = 1 << 4;
    }
}

impl ResultStatus {
    pub fn is_last(self) -> bool {
        self.contains(Self::IS_LAST)
    }

    pub fn is_not_last(self) -> bool {
        !self.is_last()
    }

    /// `IS_LAST` or nothing
    pub fn simple(is_last: bool) -> Self {
        if is_last {
            Self::IS_LAST
        } else {
            Self::empty()
        }
    }
}

/// Receiver of a stage's results
pub trait Consumer<T>: Send + Sync {
    fn on_new_result(&self, result: Option<T>, status: ResultStatus);

    fn on_failure(&self, error: PipelineError);

    fn on_cancellation(&self);

    /// Progress in `[0, 1]`; non-decreasing for one request
    fn on_progress_update(&self, progress: f32);
}

/// Shared handle to a consumer
pub type SharedConsumer<T> = Arc<dyn Consumer<T>>;

impl<T, C: Consumer<T> + ?Sized> Consumer<T> for Arc<C> {
    fn on_new_result(&self, result: Option<T>, status: ResultStatus) {
        (**self).on_new_result(result, status);
    }

    fn on_failure(&self, error: PipelineError) {
        (**self).on_failure(error);
    }

    fn on_cancellation(&self) {
        (**self).on_cancellation();
    }

    fn on_progress_update(&self, progress: f32) {
        (**self).on_progress_update(progress);
    }
}

/// Tracks whether a consumer has seen its terminal event
#[derive(Debug, Default)]
pub struct TerminalGuard {
    finished: AtomicBool,
}

impl TerminalGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark finished; returns false if it already was
    pub fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Wraps any consumer with the terminal-once rule
pub struct BaseConsumer<T, C> {
    inner: C,
    guard: TerminalGuard,
    _marker: PhantomData<fn(T)>,
}

impl<T, C: Consumer<T>> BaseConsumer<T, C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            guard: TerminalGuard::new(),
            _marker: PhantomData,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.guard.is_finished()
    }
}

impl<T: Send + 'static, C: Consumer<T> + 'static> BaseConsumer<T, C> {
    pub fn shared(inner: C) -> SharedConsumer<T> {
        Arc::new(Self::new(inner))
    }
}

impl<T: Send, C: Consumer<T>> Consumer<T> for BaseConsumer<T, C> {
    fn on_new_result(&self, result: Option<T>, status: ResultStatus) {
        if self.guard.is_finished() {
            return;
        }
        if status.is_last() && !self.guard.finish() {
            return;
        }
        self.inner.on_new_result(result, status);
    }

    fn on_failure(&self, error: PipelineError) {
        if self.guard.finish() {
            self.inner.on_failure(error);
        }
    }

    fn on_cancellation(&self) {
        if self.guard.finish() {
            self.inner.on_cancellation();
        }
    }

    fn on_progress_update(&self, progress: f32) {
        if !self.guard.is_finished() {
            self.inner.on_progress_update(progress);
        }
    }
}

/// Transformation applied by a [`DelegatingConsumer`]
pub type ResultHandler<I, O> =
    dyn Fn(&dyn Consumer<O>, Option<I>, ResultStatus) -> Result<()> + Send + Sync;

/// Consumer that transforms results and forwards them downstream.
///
/// Failure, cancellation and progress pass through unchanged. An error
/// returned by the handler becomes the single `on_failure` delivered
/// downstream, tagged with the stage name.
pub struct DelegatingConsumer<I, O> {
    downstream: SharedConsumer<O>,
    stage: &'static str,
    handler: Box<ResultHandler<I, O>>,
    guard: TerminalGuard,
}

impl<I: Send + 'static, O: Send + 'static> DelegatingConsumer<I, O> {
    pub fn new(
        downstream: SharedConsumer<O>,
        stage: &'static str,
        handler: impl Fn(&dyn Consumer<O>, Option<I>, ResultStatus) -> Result<()>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            downstream,
            stage,
            handler: Box::new(handler),
            guard: TerminalGuard::new(),
        }
    }

    /// Consumer that maps each present result and forwards `None` as is
    pub fn map(
        downstream: SharedConsumer<O>,
        stage: &'static str,
        f: impl Fn(I) -> Result<O> + Send + Sync + 'static,
    ) -> Self {
        Self::new(downstream, stage, move |consumer, result, status| {
            let mapped = result.map(&f).transpose()?;
            consumer.on_new_result(mapped, status);
            Ok(())
        })
    }

    pub fn shared(self) -> SharedConsumer<I> {
        Arc::new(self)
    }

    pub fn downstream(&self) -> &SharedConsumer<O> {
        &self.downstream
    }
}

impl<I: Send, O: Send> Consumer<I> for DelegatingConsumer<I, O> {
    fn on_new_result(&self, result: Option<I>, status: ResultStatus) {
        if self.guard.is_finished() {
            return;
        }
        if status.is_last() && !self.guard.finish() {
            return;
        }
        if let Err(error) = (self.handler)(self.downstream.as_ref(), result, status) {
            if status.is_last() || self.guard.finish() {
                warn!(stage = self.stage, "Stage failed: {}", error);
                self.downstream.on_failure(error.with_stage(self.stage));
            }
        }
    }

    fn on_failure(&self, error: PipelineError) {
        if self.guard.finish() {
            self.downstream.on_failure(error);
        }
    }

    fn on_cancellation(&self) {
        if self.guard.finish() {
            self.downstream.on_cancellation();
        }
    }

    fn on_progress_update(&self, progress: f32) {
        if !self.guard.is_finished() {
            self.downstream.on_progress_update(progress);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    /// Event recorded by [`RecordingConsumer`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum Event<T> {
        Result(Option<T>, ResultStatus),
        Failure(PipelineError),
        Cancellation,
        Progress(f32),
    }

    /// Consumer that records every call and signals terminal events
    pub struct RecordingConsumer<T> {
        events: Mutex<Vec<Event<T>>>,
        done: Notify,
    }

    impl<T: Clone> RecordingConsumer<T> {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                done: Notify::new(),
            })
        }

        pub fn events(&self) -> Vec<Event<T>> {
            self.events.lock().clone()
        }

        pub fn terminal_count(&self) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| match e {
                    Event::Result(_, status) => status.is_last(),
                    Event::Failure(_) | Event::Cancellation => true,
                    Event::Progress(_) => false,
                })
                .count()
        }

        pub fn last_result(&self) -> Option<T> {
            self.events.lock().iter().rev().find_map(|e| match e {
                Event::Result(Some(value), status) if status.is_last() => Some(value.clone()),
                _ => None,
            })
        }

        pub fn is_done(&self) -> bool {
            self.terminal_count() > 0
        }

        /// Wait for a terminal event, up to five seconds
        pub async fn wait(&self) {
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
            while !self.is_done() {
                let notified = self.done.notified();
                if self.is_done() {
                    break;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    break;
                }
            }
        }

        fn push(&self, event: Event<T>, terminal: bool) {
            self.events.lock().push(event);
            if terminal {
                self.done.notify_waiters();
            }
        }
    }

    impl<T: Clone + Send + 'static> Consumer<T> for RecordingConsumer<T> {
        fn on_new_result(&self, result: Option<T>, status: ResultStatus) {
            self.push(Event::Result(result, status), status.is_last());
        }

        fn on_failure(&self, error: PipelineError) {
            self.push(Event::Failure(error), true);
        }

        fn on_cancellation(&self) {
            self.push(Event::Cancellation, true);
        }

        fn on_progress_update(&self, progress: f32) {
            self.push(Event::Progress(progress), false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{Event, RecordingConsumer};
    use super::*;

    #[test]
    fn test_status_flags() {
        let status = ResultStatus::IS_LAST | ResultStatus::IS_PARTIAL_RESULT;
        assert!(status.is_last());
        assert!(status.contains(ResultStatus::IS_PARTIAL_RESULT));
        assert!(ResultStatus::simple(false).is_not_last());
        assert_eq!(
            (status - ResultStatus::IS_PARTIAL_RESULT).bits(),
            ResultStatus::IS_LAST.bits()
        );
    }

    #[test]
    fn test_base_consumer_drops_events_after_terminal() {
        let recording = RecordingConsumer::<u32>::new();
        let base = BaseConsumer::new(Arc::clone(&recording));

        base.on_new_result(Some(1), ResultStatus::empty());
        base.on_new_result(Some(2), ResultStatus::IS_LAST);
        base.on_new_result(Some(3), ResultStatus::IS_LAST);
        base.on_failure(PipelineError::Storage("late".into()));
        base.on_cancellation();
        base.on_progress_update(1.0);

        assert_eq!(
            recording.events(),
            vec![
                Event::Result(Some(1), ResultStatus::empty()),
                Event::Result(Some(2), ResultStatus::IS_LAST),
            ]
        );
        assert!(base.is_finished());
    }

    #[test]
    fn test_delegating_map_and_error() {
        let recording = RecordingConsumer::<String>::new();
        let consumer = DelegatingConsumer::map(recording.clone(), "Doubler", |v: u32| {
            if v == 0 {
                Err(PipelineError::Decode {
                    stage: "Doubler".into(),
                    message: "zero".into(),
                })
            } else {
                Ok((v * 2).to_string())
            }
        });

        consumer.on_new_result(Some(2), ResultStatus::empty());
        consumer.on_new_result(None, ResultStatus::empty());
        consumer.on_new_result(Some(0), ResultStatus::IS_LAST);
        consumer.on_cancellation();

        let events = recording.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], Event::Result(Some("4".into()), ResultStatus::empty()));
        assert_eq!(events[1], Event::Result(None, ResultStatus::empty()));
        assert!(matches!(events[2], Event::Failure(ref e) if e.stage() == Some("Doubler")));
        assert_eq!(recording.terminal_count(), 1);
    }

    #[test]
    fn test_delegating_forwards_progress_and_cancellation() {
        let recording = RecordingConsumer::<u32>::new();
        let consumer = DelegatingConsumer::map(recording.clone(), "Identity", |v: u32| Ok(v));

        consumer.on_progress_update(0.5);
        consumer.on_cancellation();
        consumer.on_progress_update(0.9);

        assert_eq!(
            recording.events(),
            vec![Event::Progress(0.5), Event::Cancellation]
        );
    }
}
