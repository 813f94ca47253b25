//! Bounded, parallel shutdown of a set of workers

use crate::error::{Result, VoxError};
use crate::runtime::worker::WorkerTask;
use crossbeam_channel::unbounded;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReport {
    /// Every worker completed and was disposed
    Completed { elapsed: Duration },
    /// The shared deadline passed; `pending` workers were canceled but not observed to finish
    TimedOut { pending: Vec<String> },
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        matches!(self, ShutdownReport::Completed { .. })
    }

    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            ShutdownReport::Completed { elapsed } => Some(*elapsed),
            ShutdownReport::TimedOut { .. } => None,
        }
    }
}

/// Cancel every running worker and wait for all of them against one deadline
///
/// Completed workers are disposed right away. Each running worker is canceled and
/// gets its own stopper thread that waits for it and disposes it. Must not be
/// called from the thread of a worker in `workers`.
pub fn cancel_stop_dispose_all(workers: &[WorkerTask], timeout: Duration) -> Result<ShutdownReport> {
    let current = thread::current().id();
    if let Some(worker) = workers
        .iter()
        .find(|worker| !worker.is_completed() && worker.thread_id() == Some(current))
    {
        return Err(VoxError::SelfJoin {
            label: worker.label().to_string(),
        });
    }

    let start = Instant::now();
    let deadline = start + timeout;
    let (done_tx, done_rx) = unbounded::<usize>();
    let mut pending: Vec<Option<String>> = vec![None; workers.len()];

    for (index, worker) in workers.iter().enumerate() {
        if worker.is_completed() {
            worker.dispose();
            continue;
        }

        worker.cancel();
        pending[index] = Some(worker.label().to_string());

        let worker = worker.clone();
        let done_tx = done_tx.clone();
        thread::Builder::new()
            .name(format!("stop-{}", worker.label()))
            .spawn(move || {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if worker.wait(remaining) {
                    worker.dispose();
                    let _ = done_tx.send(index);
                }
            })?;
    }
    drop(done_tx);

    let mut outstanding = pending.iter().filter(|label| label.is_some()).count();
    while outstanding > 0 {
        match done_rx.recv_deadline(deadline) {
            Ok(index) => {
                pending[index] = None;
                outstanding -= 1;
            }
            // Deadline passed, or every stopper gave up
            Err(_) => break,
        }
    }

    let pending: Vec<String> = pending.into_iter().flatten().collect();
    if pending.is_empty() {
        let elapsed = start.elapsed();
        info!("Stopped {} workers in {:?}", workers.len(), elapsed);
        Ok(ShutdownReport::Completed { elapsed })
    } else {
        warn!(
            "Failed to stop workers within {:?}: {}",
            timeout,
            pending.join(", ")
        );
        debug!("Workers left for background cancellation");
        Ok(ShutdownReport::TimedOut { pending })
    }
}
