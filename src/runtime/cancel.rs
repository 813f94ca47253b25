//! Cancellation-signal tree
//!
//! A [`CancelSource`] wraps a [`CancellationToken`]. Sources created with
//! [`CancelSource::linked`] hold a child token of another signal: canceling a
//! node cancels its whole subtree, canceling a child leaves parent and siblings
//! untouched.
//!
//! Async code awaits [`CancelToken::cancelled`]. Worker threads and ring buffers
//! are plain threads parked on condvars, so two blocking adapters sit on top of
//! the token's wait future:
//! - [`CancelToken::wait_timeout`] polls it with a waker that unparks the calling thread
//! - [`CancelToken::on_cancel`] polls it with a waker that runs a callback, used to
//!   wake foreign condvars and channels

use futures::task::{self, ArcWake};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::Context;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::trace;

/// Owning side of a cancellation node
pub struct CancelSource {
    label: Arc<str>,
    token: CancellationToken,
    /// Serializes check-and-cancel so only one caller sees the transition
    transition: Mutex<()>,
}

impl CancelSource {
    /// Create an independent root signal
    pub fn new(label: impl Into<String>) -> Self {
        Self::from_token(label.into(), CancellationToken::new())
    }

    /// Create a signal that is canceled whenever `parent` is
    ///
    /// If the parent is already canceled the new signal starts out canceled.
    pub fn linked(label: impl Into<String>, parent: &CancelToken) -> Self {
        Self::from_token(label.into(), parent.token.child_token())
    }

    fn from_token(label: String, token: CancellationToken) -> Self {
        Self {
            label: label.into(),
            token,
            transition: Mutex::new(()),
        }
    }

    /// Get a read-only token observing this signal
    pub fn token(&self) -> CancelToken {
        CancelToken {
            label: Arc::clone(&self.label),
            token: self.token.clone(),
        }
    }

    /// Cancel this signal and all of its descendants
    ///
    /// Idempotent: returns `true` only for the call that canceled it. A signal
    /// already canceled through its parent returns `false`.
    pub fn cancel(&self) -> bool {
        let _transition = self.transition.lock();
        if self.token.is_cancelled() {
            return false;
        }
        trace!("Cancel signal '{}' fired", self.label);
        self.token.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("label", &self.label)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Observing side of a cancellation node
#[derive(Clone)]
pub struct CancelToken {
    label: Arc<str>,
    token: CancellationToken,
}

impl CancelToken {
    /// A token that nothing will ever cancel
    pub fn none() -> Self {
        Self {
            label: Arc::from("none"),
            token: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Block until canceled or until `timeout` elapses
    ///
    /// Returns `true` if the token is canceled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.park_until(Some(Instant::now() + timeout))
    }

    /// Block until canceled
    pub fn wait(&self) {
        self.park_until(None);
    }

    fn park_until(&self, deadline: Option<Instant>) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let waker = task::waker(Arc::new(Unparker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut cancelled = pin!(self.token.cancelled());
        loop {
            if cancelled.as_mut().poll(&mut cx).is_ready() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.is_cancelled();
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }

    /// Resolve once the token is canceled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run `callback` when the token is canceled
    ///
    /// The callback runs on the canceling thread, inside the cancel call, so it
    /// must not cancel or link signals itself. If the token is already canceled
    /// it runs immediately on the calling thread. Dropping the returned
    /// registration unregisters it.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener = Arc::new(Listener {
            callback: Box::new(callback),
            pending: Mutex::new(Some(Box::pin(self.token.clone().cancelled_owned()))),
        });
        listener.poll();
        CancelRegistration { listener }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("label", &self.label)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct Unparker(Thread);

impl ArcWake for Unparker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

struct Listener {
    callback: Box<dyn Fn() + Send + Sync>,
    /// `None` once the callback ran or the registration was dropped
    pending: Mutex<Option<Pin<Box<WaitForCancellationFutureOwned>>>>,
}

impl Listener {
    fn poll(self: &Arc<Self>) {
        let fired = {
            let mut pending = self.pending.lock();
            let Some(cancelled) = pending.as_mut() else {
                return;
            };
            let waker = task::waker_ref(self);
            let mut cx = Context::from_waker(&waker);
            let ready = cancelled.as_mut().poll(&mut cx).is_ready();
            if ready {
                *pending = None;
            }
            ready
        };
        if fired {
            (self.callback)();
        }
    }
}

impl ArcWake for Listener {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.poll();
    }
}

/// Keeps an `on_cancel` callback registered while alive
#[must_use = "dropping the registration unregisters the callback"]
pub struct CancelRegistration {
    listener: Arc<Listener>,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        // Dropped outside the lock: dropping the future touches the token's waiter list
        let pending = self.listener.pending.lock().take();
        drop(pending);
    }
}
