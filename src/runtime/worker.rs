//! Cancellable background workers
//!
//! A [`WorkerTask`] runs one function on its own OS thread. The function receives
//! a [`CancelToken`] and is expected to return promptly once it is canceled.
//! Errors and panics are captured and surfaced as a [`WorkerFault`] event; they
//! never unwind out of the worker.

use crate::error::{Result, VoxError};
use crate::runtime::cancel::{CancelSource, CancelToken};
use crate::runtime::events::EventRegistry;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Created,
    Running,
    /// Cancellation requested, the function is still running
    Canceled,
    /// The function failed, `Finished` not yet published
    Faulted,
    Completed,
}

/// Lifecycle notifications published on [`WorkerTask::events`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLifecycle {
    Started,
    Canceled,
    Finished,
}

/// Published when the worker function returns an error or panics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFault {
    pub label: String,
    pub message: String,
}

type WorkFn = Box<dyn FnOnce(CancelToken) -> anyhow::Result<()> + Send>;

struct WorkerInner {
    label: String,
    cancel: CancelSource,
    status: Mutex<WorkerStatus>,
    status_changed: Condvar,
    events: Arc<EventRegistry>,
    work: Mutex<Option<WorkFn>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
    fault: Mutex<Option<String>>,
}

/// Handle to a background worker; clones share the same worker
#[derive(Clone)]
pub struct WorkerTask {
    inner: Arc<WorkerInner>,
}

impl WorkerTask {
    /// Create a worker with an independent cancellation signal
    pub fn new<F>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(CancelToken) -> anyhow::Result<()> + Send + 'static,
    {
        let label = label.into();
        let cancel = CancelSource::new(label.clone());
        Self::with_source(label, cancel, Box::new(work))
    }

    /// Create a worker whose signal is canceled along with `parent`
    pub fn linked<F>(label: impl Into<String>, parent: &CancelToken, work: F) -> Self
    where
        F: FnOnce(CancelToken) -> anyhow::Result<()> + Send + 'static,
    {
        let label = label.into();
        let cancel = CancelSource::linked(label.clone(), parent);
        Self::with_source(label, cancel, Box::new(work))
    }

    fn with_source(label: String, cancel: CancelSource, work: WorkFn) -> Self {
        let events = Arc::new(EventRegistry::new());
        // Fresh registry, enabling cannot collide
        let _ = events.enable::<WorkerLifecycle>();
        let _ = events.enable::<WorkerFault>();

        Self {
            inner: Arc::new(WorkerInner {
                label,
                cancel,
                status: Mutex::new(WorkerStatus::Created),
                status_changed: Condvar::new(),
                events,
                work: Mutex::new(Some(work)),
                handle: Mutex::new(None),
                thread_id: Mutex::new(None),
                fault: Mutex::new(None),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Lifecycle registry: [`WorkerLifecycle`] and [`WorkerFault`] are enabled
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.inner.events
    }

    pub fn token(&self) -> CancelToken {
        self.inner.cancel.token()
    }

    pub fn status(&self) -> WorkerStatus {
        *self.inner.status.lock()
    }

    pub fn is_completed(&self) -> bool {
        self.status() == WorkerStatus::Completed
    }

    /// Message of the captured error or panic, if the function failed
    pub fn fault(&self) -> Option<String> {
        self.inner.fault.lock().clone()
    }

    pub(crate) fn thread_id(&self) -> Option<ThreadId> {
        *self.inner.thread_id.lock()
    }

    /// Run the function on a new thread named after the worker
    pub fn start(&self) -> Result<()> {
        let work = self.take_work()?;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(self.inner.label.clone())
            .spawn(move || inner.run(work))?;
        *self.inner.handle.lock() = Some(handle);
        Ok(())
    }

    /// Run the function on the calling thread, returning once it completes
    pub fn start_synchronously(&self) -> Result<()> {
        let work = self.take_work()?;
        self.inner.run(work);
        Ok(())
    }

    /// Subscribe `action` to `Finished`, then start
    pub fn start_and_finish_with<F>(&self, action: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .events
            .subscribe::<WorkerLifecycle, _>(move |lifecycle| {
                if *lifecycle == WorkerLifecycle::Finished {
                    action();
                }
            })?;
        self.start()
    }

    /// Request cancellation; `Canceled` is published only on the first call
    ///
    /// A worker that was never started drops its function and completes here.
    pub fn cancel(&self) {
        if self.inner.cancel.cancel() {
            debug!("Worker '{}' canceled", self.inner.label);
            {
                let mut status = self.inner.status.lock();
                if *status == WorkerStatus::Running {
                    *status = WorkerStatus::Canceled;
                }
            }
            self.inner.publish_guarded(WorkerLifecycle::Canceled);
        }
        self.inner.retire_unstarted();
    }

    /// Block until the worker completes or `timeout` elapses
    ///
    /// Returns `true` if the worker completed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.inner.status.lock();
        while *status != WorkerStatus::Completed {
            if self
                .inner
                .status_changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }
        *status == WorkerStatus::Completed
    }

    /// Release the lifecycle registry and join the thread
    ///
    /// Only completed workers are disposed; returns `false` otherwise.
    pub fn dispose(&self) -> bool {
        if !self.is_completed() {
            warn!("Worker '{}' disposed before completion", self.inner.label);
            return false;
        }
        self.inner.events.clear();
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Worker '{}' thread panicked after completion", self.inner.label);
            }
        }
        trace!("Worker '{}' disposed", self.inner.label);
        true
    }

    fn take_work(&self) -> Result<WorkFn> {
        let work = self
            .inner
            .work
            .lock()
            .take()
            .ok_or_else(|| VoxError::WorkerAlreadyStarted {
                label: self.inner.label.clone(),
            })?;

        let mut status = self.inner.status.lock();
        if *status == WorkerStatus::Created {
            *status = WorkerStatus::Running;
        }
        Ok(work)
    }
}

impl WorkerInner {
    fn run(&self, work: WorkFn) {
        *self.thread_id.lock() = Some(thread::current().id());
        debug!("Worker '{}' started", self.label);
        self.publish_guarded(WorkerLifecycle::Started);

        let token = self.cancel.token();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || work(token)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(message) = failure {
            error!("Worker '{}' faulted: {}", self.label, message);
            *self.fault.lock() = Some(message.clone());
            self.set_status(WorkerStatus::Faulted);
            self.publish_guarded(WorkerFault {
                label: self.label.clone(),
                message,
            });
        }

        self.publish_guarded(WorkerLifecycle::Finished);
        self.set_status(WorkerStatus::Completed);
        debug!("Worker '{}' finished", self.label);
    }

    /// Complete a worker whose function never ran
    fn retire_unstarted(&self) {
        let Some(work) = self.work.lock().take() else {
            return;
        };
        drop(work);
        debug!("Worker '{}' canceled before it started", self.label);
        self.publish_guarded(WorkerLifecycle::Finished);
        self.set_status(WorkerStatus::Completed);
    }

    fn set_status(&self, next: WorkerStatus) {
        *self.status.lock() = next;
        self.status_changed.notify_all();
    }

    /// Publish on the lifecycle registry without letting a handler's panic escape
    fn publish_guarded<M: crate::runtime::events::Message>(&self, message: M) {
        let events = &self.events;
        match panic::catch_unwind(AssertUnwindSafe(|| events.publish(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!("Worker '{}' event dropped: {}", self.label, e),
            Err(payload) => error!(
                "Worker '{}' event handler panicked: {}",
                self.label,
                panic_message(payload.as_ref())
            ),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for WorkerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTask")
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collect_lifecycle(worker: &WorkerTask) -> Arc<Mutex<Vec<WorkerLifecycle>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        worker
            .events()
            .subscribe::<WorkerLifecycle, _>(move |event| sink.lock().push(*event))
            .unwrap();
        seen
    }

    #[test]
    fn test_normal_run_publishes_started_and_finished() {
        let worker = WorkerTask::new("plain", |_| Ok(()));
        let seen = collect_lifecycle(&worker);

        worker.start().unwrap();
        assert!(worker.wait(Duration::from_secs(5)));

        assert_eq!(
            *seen.lock(),
            vec![WorkerLifecycle::Started, WorkerLifecycle::Finished]
        );
        assert!(worker.fault().is_none());
        assert!(worker.dispose());
    }

    #[test]
    fn test_start_twice_fails() {
        let worker = WorkerTask::new("twice", |_| Ok(()));
        worker.start_synchronously().unwrap();
        let err = worker.start().unwrap_err();
        assert!(matches!(err, VoxError::WorkerAlreadyStarted { .. }));
    }

    #[test]
    fn test_error_is_captured_as_fault_then_finished() {
        let worker = WorkerTask::new("failing", |_| anyhow::bail!("device unplugged"));
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&faults);
        worker
            .events()
            .subscribe::<WorkerFault, _>(move |fault| sink.lock().push(fault.message.clone()))
            .unwrap();
        let seen = collect_lifecycle(&worker);

        worker.start_synchronously().unwrap();

        assert_eq!(*faults.lock(), vec!["device unplugged".to_string()]);
        assert_eq!(seen.lock().last(), Some(&WorkerLifecycle::Finished));
        assert!(worker.is_completed());
    }

    #[test]
    fn test_panic_is_captured() {
        let worker = WorkerTask::new("panicking", |_| panic!("boom"));
        worker.start().unwrap();
        assert!(worker.wait(Duration::from_secs(5)));
        assert_eq!(worker.fault().as_deref(), Some("boom"));
    }

    #[test]
    fn test_cancel_is_published_once_and_observed() {
        let worker = WorkerTask::new("blocking", |token| {
            token.wait();
            Ok(())
        });
        let seen = collect_lifecycle(&worker);

        worker.start().unwrap();
        worker.cancel();
        worker.cancel();
        assert!(worker.wait(Duration::from_secs(5)));

        let canceled = seen
            .lock()
            .iter()
            .filter(|event| **event == WorkerLifecycle::Canceled)
            .count();
        assert_eq!(canceled, 1);
    }

    #[test]
    fn test_cancel_before_start_completes_the_worker() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let worker = WorkerTask::new("never-started", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let seen = collect_lifecycle(&worker);

        worker.cancel();

        assert_eq!(worker.status(), WorkerStatus::Completed);
        assert!(worker.wait(Duration::from_millis(10)));
        assert_eq!(
            *seen.lock(),
            vec![WorkerLifecycle::Canceled, WorkerLifecycle::Finished]
        );
        assert!(matches!(
            worker.start(),
            Err(VoxError::WorkerAlreadyStarted { .. })
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(worker.dispose());
    }

    #[test]
    fn test_unstarted_worker_canceled_through_parent_still_completes() {
        let parent = CancelSource::new("shell");
        let worker = WorkerTask::linked("late", &parent.token(), |_| Ok(()));
        parent.cancel();
        assert_eq!(worker.status(), WorkerStatus::Created);

        worker.cancel();
        assert_eq!(worker.status(), WorkerStatus::Completed);
    }

    #[test]
    fn test_linked_worker_follows_parent() {
        let parent = CancelSource::new("shell");
        let worker = WorkerTask::linked("child", &parent.token(), |token| {
            token.wait();
            Ok(())
        });
        worker.start().unwrap();
        parent.cancel();
        assert!(worker.wait(Duration::from_secs(5)));
    }

    #[test]
    fn test_start_and_finish_with_runs_action() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let worker = WorkerTask::new("action", |_| Ok(()));
        worker
            .start_and_finish_with(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(worker.wait(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_times_out_on_stubborn_worker() {
        let release = CancelSource::new("release");
        let token = release.token();
        let worker = WorkerTask::new("stubborn", move |_| {
            token.wait();
            Ok(())
        });
        worker.start().unwrap();
        worker.cancel();
        assert!(!worker.wait(Duration::from_millis(30)));
        assert!(!worker.dispose());
        release.cancel();
        assert!(worker.wait(Duration::from_secs(5)));
    }
}
