//! Executors for pipeline work and the single-slot job scheduler

use crate::consumer::ResultStatus;
use crate::error::{PipelineError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Runtime handles for each class of pipeline work
#[derive(Debug, Clone)]
pub struct ExecutorSupplier {
    /// Network and disk I/O
    io: Handle,

    /// CPU-bound decoding, run on the blocking pool
    decode: Handle,

    /// Postprocessing, hand-offs and cache writes
    background: Handle,
}

impl ExecutorSupplier {
    /// Use the runtime the caller is running on for everything
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| PipelineError::Executor(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_handle(handle))
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            io: handle.clone(),
            decode: handle.clone(),
            background: handle,
        }
    }

    pub fn with_io(mut self, handle: Handle) -> Self {
        self.io = handle;
        self
    }

    pub fn with_decode(mut self, handle: Handle) -> Self {
        self.decode = handle;
        self
    }

    pub fn with_background(mut self, handle: Handle) -> Self {
        self.background = handle;
        self
    }

    pub fn spawn_io<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.io.spawn(future)
    }

    pub fn spawn_background<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.background.spawn(future)
    }

    pub fn spawn_decode<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.decode.spawn_blocking(f)
    }

    pub fn decode_handle(&self) -> &Handle {
        &self.decode
    }

    pub fn background_handle(&self) -> &Handle {
        &self.background
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobPhase {
    Idle,
    Queued,
    Running,
    RunningAndPending,
}

struct JobState<T> {
    pending: Option<(T, ResultStatus)>,
    phase: JobPhase,
}

type JobFn<T> = dyn Fn(T, ResultStatus) + Send + Sync;

struct JobInner<T> {
    state: Mutex<JobState<T>>,
    job: Box<JobFn<T>>,
    handle: Handle,
}

/// Runs at most one job at a time on the blocking pool, keeping only the
/// latest pending input.
///
/// Superseded intermediate inputs are dropped; the last input of a request
/// is always the latest one, so it is never dropped.
pub struct JobScheduler<T> {
    inner: Arc<JobInner<T>>,
}

impl<T> Clone for JobScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> JobScheduler<T> {
    pub fn new(handle: Handle, job: impl Fn(T, ResultStatus) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(JobInner {
                state: Mutex::new(JobState {
                    pending: None,
                    phase: JobPhase::Idle,
                }),
                job: Box::new(job),
                handle,
            }),
        }
    }

    /// Replace the pending input
    pub fn update_job(&self, input: T, status: ResultStatus) {
        self.inner.state.lock().pending = Some((input, status));
    }

    /// Drop the pending input, if any
    pub fn clear_job(&self) {
        let dropped = self.inner.state.lock().pending.take();
        drop(dropped);
    }

    /// Make sure the pending input will be processed; returns false if
    /// there is nothing to do
    pub fn schedule_job(&self) -> bool {
        let submit = {
            let mut state = self.inner.state.lock();
            if state.pending.is_none() {
                return false;
            }
            match state.phase {
                JobPhase::Idle => {
                    state.phase = JobPhase::Queued;
                    true
                }
                JobPhase::Running => {
                    state.phase = JobPhase::RunningAndPending;
                    false
                }
                JobPhase::Queued | JobPhase::RunningAndPending => false,
            }
        };
        if submit {
            Self::submit(Arc::clone(&self.inner));
        }
        true
    }

    fn submit(inner: Arc<JobInner<T>>) {
        let handle = inner.handle.clone();
        handle.spawn_blocking(move || Self::run(inner));
    }

    fn run(inner: Arc<JobInner<T>>) {
        let input = {
            let mut state = inner.state.lock();
            state.phase = JobPhase::Running;
            state.pending.take()
        };
        if let Some((input, status)) = input {
            (inner.job)(input, status);
        }

        let resubmit = {
            let mut state = inner.state.lock();
            if state.phase == JobPhase::RunningAndPending && state.pending.is_some() {
                state.phase = JobPhase::Queued;
                true
            } else {
                state.phase = JobPhase::Idle;
                false
            }
        };
        if resubmit {
            Self::submit(inner);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduler_keeps_latest_and_last() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(std::sync::Barrier::new(2));
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let started_tx = Mutex::new(started_tx);

        let recorder = Arc::clone(&seen);
        let job_gate = Arc::clone(&gate);
        let scheduler = JobScheduler::new(Handle::current(), move |value: u32, status| {
            if value == 1 {
                let _ = started_tx.lock().send(());
                job_gate.wait();
            }
            recorder.lock().push((value, status.is_last()));
        });

        scheduler.update_job(1, ResultStatus::empty());
        assert!(scheduler.schedule_job());
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        scheduler.update_job(2, ResultStatus::empty());
        scheduler.schedule_job();
        scheduler.update_job(3, ResultStatus::IS_LAST);
        scheduler.schedule_job();
        gate.wait();

        for _ in 0..100 {
            if seen.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock(), vec![(1, false), (3, true)]);
    }

    #[tokio::test]
    async fn test_schedule_without_job() {
        let scheduler = JobScheduler::new(Handle::current(), |_: u32, _| {});
        assert!(!scheduler.schedule_job());
        scheduler.update_job(1, ResultStatus::IS_LAST);
        scheduler.clear_job();
        assert!(!scheduler.schedule_job());
    }

    #[test]
    fn test_supplier_requires_runtime() {
        assert!(matches!(
            ExecutorSupplier::current(),
            Err(PipelineError::Executor(_))
        ));
    }
}
