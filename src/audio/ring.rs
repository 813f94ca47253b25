//! Thread-safe byte ring buffer with blocking waits
//!
//! `RingBufferStream` decouples real-time audio producers (device callbacks,
//! network deltas) from consumers. Writes never block: anything beyond the free
//! space is dropped and counted. Waits block on a condvar that is also woken by
//! the stream's cancellation token and by dispose.

use crate::runtime::cancel::{CancelRegistration, CancelToken};
use parking_lot::{Condvar, Mutex};
use ringbuf::{traits::*, HeapRb};
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

struct RingState {
    /// `None` once disposed
    ring: Option<HeapRb<u8>>,
    total_written: u64,
    total_read: u64,
    overflow_bytes: u64,
}

struct RingShared {
    capacity: usize,
    state: Mutex<RingState>,
    data_ready: Condvar,
    cancel: CancelToken,
    _wake: Mutex<Option<CancelRegistration>>,
}

impl RingShared {
    fn wake_waiters(&self) {
        // Taking the lock orders the wakeup after any in-progress check
        let _state = self.state.lock();
        self.data_ready.notify_all();
    }
}

/// Fixed-capacity byte FIFO shared between threads
///
/// Clones share the same buffer.
#[derive(Clone)]
pub struct RingBufferStream {
    shared: Arc<RingShared>,
}

impl RingBufferStream {
    pub fn new(capacity: usize, cancel: CancelToken) -> Self {
        let capacity = capacity.max(1);
        let shared = Arc::new_cyclic(|weak: &Weak<RingShared>| {
            let weak = weak.clone();
            let registration = cancel.on_cancel(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.wake_waiters();
                }
            });
            RingShared {
                capacity,
                state: Mutex::new(RingState {
                    ring: Some(HeapRb::new(capacity)),
                    total_written: 0,
                    total_read: 0,
                    overflow_bytes: 0,
                }),
                data_ready: Condvar::new(),
                cancel,
                _wake: Mutex::new(Some(registration)),
            }
        });
        Self { shared }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn token(&self) -> &CancelToken {
        &self.shared.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().ring.is_none()
    }

    /// Copy as much of `bytes` as fits; returns the number accepted
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut state = self.shared.state.lock();
        let Some(ring) = state.ring.as_mut() else {
            return 0;
        };
        let written = ring.push_slice(bytes);
        let dropped = bytes.len() - written;

        state.total_written += written as u64;
        if dropped > 0 {
            state.overflow_bytes += dropped as u64;
            trace!("Ring buffer full, dropped {} bytes", dropped);
        }
        if written > 0 {
            self.shared.data_ready.notify_all();
        }
        written
    }

    /// Pop up to `buf.len()` bytes without waiting
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.shared.state.lock();
        let Some(ring) = state.ring.as_mut() else {
            return 0;
        };
        let read = ring.pop_slice(buf);
        state.total_read += read as u64;
        read
    }

    /// Block until at least `min_bytes` are buffered
    ///
    /// Returns `false` on cancellation, on timeout, once disposed, or when
    /// `min_bytes` exceeds the capacity and could never be satisfied.
    pub fn wait_data_available(&self, min_bytes: usize, timeout: Option<Duration>) -> bool {
        self.wait_inner(min_bytes, timeout, None)
    }

    /// Like [`wait_data_available`](Self::wait_data_available), also returning
    /// early when `also` is canceled
    pub fn wait_data_available_or(
        &self,
        min_bytes: usize,
        timeout: Option<Duration>,
        also: &CancelToken,
    ) -> bool {
        self.wait_inner(min_bytes, timeout, Some(also))
    }

    fn wait_inner(
        &self,
        min_bytes: usize,
        timeout: Option<Duration>,
        also: Option<&CancelToken>,
    ) -> bool {
        // Registered before locking: an already-canceled token runs the callback inline
        let _wake = also.map(|token| {
            let weak = Arc::downgrade(&self.shared);
            token.on_cancel(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.wake_waiters();
                }
            })
        });

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.state.lock();
        loop {
            let Some(ring) = state.ring.as_ref() else {
                return false;
            };
            if ring.occupied_len() >= min_bytes {
                return true;
            }
            if min_bytes > self.shared.capacity {
                return false;
            }
            if self.shared.cancel.is_cancelled() || also.is_some_and(|token| token.is_cancelled()) {
                return false;
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .data_ready
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return state
                            .ring
                            .as_ref()
                            .is_some_and(|ring| ring.occupied_len() >= min_bytes);
                    }
                }
                None => self.shared.data_ready.wait(&mut state),
            }
        }
    }

    /// Drop buffered bytes and restart the written-bytes count
    pub fn clear_buffer(&self) {
        let mut state = self.shared.state.lock();
        if let Some(ring) = state.ring.as_mut() {
            ring.clear();
        }
        state.total_written = 0;
    }

    /// Release the buffer; reads return 0 and waits return `false` from now on
    pub fn dispose(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.ring.take().is_none() {
                return;
            }
            self.shared.data_ready.notify_all();
        }
        self.shared._wake.lock().take();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared
            .state
            .lock()
            .ring
            .as_ref()
            .map(|ring| ring.occupied_len())
            .unwrap_or(0)
    }

    /// Bytes accepted since creation or the last clear
    pub fn total_written(&self) -> u64 {
        self.shared.state.lock().total_written
    }

    pub fn total_read(&self) -> u64 {
        self.shared.state.lock().total_read
    }

    /// Bytes refused because the buffer was full
    pub fn overflow_bytes(&self) -> u64 {
        self.shared.state.lock().overflow_bytes
    }
}

impl io::Write for RingBufferStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_disposed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "ring buffer disposed"));
        }
        Ok(RingBufferStream::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for RingBufferStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferStream")
            .field("capacity", &self.shared.capacity)
            .field("buffered", &self.buffered_bytes())
            .finish()
    }
}
