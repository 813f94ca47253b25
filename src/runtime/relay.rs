//! Single-consumer relay worker
//!
//! Many threads publish, one relay thread executes. Every accepted entry runs on
//! the relay worker in the order its `try_write` returned `true`. Closing the
//! relay drains what is already queued and then stops; anything written after the
//! close is refused.

use crate::error::Result;
use crate::runtime::cancel::CancelToken;
use crate::runtime::events::{EventRegistry, Message};
use crate::runtime::worker::{panic_message, WorkerTask};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

type Action = Box<dyn FnOnce() + Send>;

pub(crate) enum RelayEntry {
    Action(Action),
    /// Last entry: run it, then stop the loop
    Final(Action),
}

struct QueueShared {
    label: String,
    tx: Sender<RelayEntry>,
    /// Guards acceptance so channel order equals `try_write` success order
    complete: Mutex<bool>,
}

/// Producer side of a relay worker's FIFO
#[derive(Clone)]
pub struct RelayQueue {
    shared: Arc<QueueShared>,
}

impl RelayQueue {
    pub(crate) fn channel(label: impl Into<String>) -> (Self, Receiver<RelayEntry>) {
        let (tx, rx) = unbounded();
        let queue = Self {
            shared: Arc::new(QueueShared {
                label: label.into(),
                tx,
                complete: Mutex::new(false),
            }),
        };
        (queue, rx)
    }

    /// A queue with no consumer; every write is refused
    #[cfg(test)]
    pub(crate) fn detached(label: &str) -> Self {
        let (queue, _) = Self::channel(label);
        queue.mark_complete();
        queue
    }

    /// Enqueue `action`; `false` means the relay is shutting down
    pub fn try_write<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.write_entry(RelayEntry::Action(Box::new(action)), false)
    }

    /// Enqueue `action` as the last entry the relay will accept
    pub fn try_write_final<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.write_entry(RelayEntry::Final(Box::new(action)), true)
    }

    pub fn is_complete(&self) -> bool {
        *self.shared.complete.lock()
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    fn write_entry(&self, entry: RelayEntry, last: bool) -> bool {
        let mut complete = self.shared.complete.lock();
        if *complete {
            return false;
        }
        if self.shared.tx.send(entry).is_err() {
            *complete = true;
            return false;
        }
        if last {
            *complete = true;
        }
        true
    }

    fn mark_complete(&self) {
        *self.shared.complete.lock() = true;
    }
}

/// Terminal message: queued behind everything already accepted, then stops the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseRelay;

/// Worker draining a [`RelayQueue`] in arrival order
#[derive(Clone)]
pub struct RelayWorker {
    worker: WorkerTask,
    queue: RelayQueue,
    events: Arc<EventRegistry>,
}

impl RelayWorker {
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let (queue, rx) = RelayQueue::channel(label.clone());

        let loop_queue = queue.clone();
        let loop_label = label.clone();
        let worker = WorkerTask::new(label, move |token: CancelToken| {
            drain_loop(&loop_label, &loop_queue, rx, token);
            Ok(())
        });

        let events = Arc::new(EventRegistry::new());
        events.enable::<CloseRelay>()?;
        let close_queue = queue.clone();
        events.subscribe::<CloseRelay, _>(move |_| {
            let label = close_queue.label().to_string();
            if close_queue.try_write_final(move || debug!("Relay '{}' closed", label)) {
                trace!("Relay '{}' close requested", close_queue.label());
            }
        })?;

        Ok(Self {
            worker,
            queue,
            events,
        })
    }

    pub fn queue(&self) -> &RelayQueue {
        &self.queue
    }

    /// Registry with [`CloseRelay`] enabled
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn worker(&self) -> &WorkerTask {
        &self.worker
    }

    pub fn start(&self) -> Result<()> {
        self.worker.start()
    }

    /// Run the drain loop on the calling thread until the relay is closed or canceled
    pub fn run_synchronously(&self) -> Result<()> {
        self.worker.start_synchronously()
    }

    pub fn try_write<F>(&self, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.try_write(action)
    }

    /// Drain what is queued, then stop; `false` if already closing
    pub fn close(&self) -> bool {
        let accepted = !self.queue.is_complete();
        if let Err(e) = self.events.publish(CloseRelay) {
            warn!("Relay '{}' close failed: {}", self.queue.label(), e);
            return false;
        }
        accepted
    }

    /// Stop after the current entry, discarding the rest
    pub fn cancel(&self) {
        self.worker.cancel();
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.worker.wait(timeout)
    }
}

fn drain_loop(label: &str, queue: &RelayQueue, rx: Receiver<RelayEntry>, token: CancelToken) {
    let (wake_tx, wake_rx) = bounded::<()>(1);
    let cancel_queue = queue.clone();
    let _registration = token.on_cancel(move || {
        cancel_queue.mark_complete();
        let _ = wake_tx.try_send(());
    });

    let mut executed = 0usize;
    loop {
        if token.is_cancelled() {
            break;
        }
        select! {
            recv(rx) -> entry => match entry {
                Ok(RelayEntry::Action(action)) => {
                    run_entry(label, action);
                    executed += 1;
                }
                Ok(RelayEntry::Final(action)) => {
                    run_entry(label, action);
                    executed += 1;
                    break;
                }
                Err(_) => break,
            },
            recv(wake_rx) -> _ => break,
        }
    }

    queue.mark_complete();
    let discarded = rx.try_iter().count();
    if discarded > 0 {
        debug!(
            "Relay '{}' stopped with {} queued entries discarded",
            label, discarded
        );
    }
    trace!("Relay '{}' executed {} entries", label, executed);
}

fn run_entry(label: &str, action: Action) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
        error!(
            "Relay '{}' action panicked: {}",
            label,
            panic_message(payload.as_ref())
        );
    }
}

enum RelayTarget<M> {
    Handler(Arc<dyn Fn(&M) + Send + Sync>),
    Registry(Arc<EventRegistry>),
}

/// Subscription that runs on a relay worker instead of the publisher's thread
pub struct EventRelay<M: Message> {
    queue: RelayQueue,
    target: RelayTarget<M>,
}

impl<M: Message> EventRelay<M> {
    /// Relay each message to `handler`, executed on the relay thread
    pub fn to_handler<F>(queue: &RelayQueue, handler: F) -> Self
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        Self {
            queue: queue.clone(),
            target: RelayTarget::Handler(Arc::new(handler)),
        }
    }

    /// Republish each message on `downstream`, from the relay thread
    pub fn to_registry(queue: &RelayQueue, downstream: &Arc<EventRegistry>) -> Self {
        Self {
            queue: queue.clone(),
            target: RelayTarget::Registry(Arc::clone(downstream)),
        }
    }

    /// Enqueue delivery of `message`; `false` if the relay no longer accepts work
    pub fn deliver(&self, message: &M) -> bool {
        let message = message.clone();
        match &self.target {
            RelayTarget::Handler(handler) => {
                let handler = Arc::clone(handler);
                self.queue.try_write(move || handler(&message))
            }
            RelayTarget::Registry(downstream) => {
                let downstream = Arc::clone(downstream);
                self.queue.try_write(move || {
                    if let Err(e) = downstream.publish(message) {
                        warn!("Relayed event dropped: {}", e);
                    }
                })
            }
        }
    }
}
