//! Worker runtime: cancellation signals, workers, events, relays, shutdown

pub mod cancel;
pub mod events;
pub mod fan_in;
pub mod relay;
pub mod shutdown;
pub mod worker;

pub use cancel::{CancelRegistration, CancelSource, CancelToken};
pub use events::{EventRegistry, Message};
pub use fan_in::CompletionCounter;
pub use relay::{CloseRelay, EventRelay, RelayQueue, RelayWorker};
pub use shutdown::{cancel_stop_dispose_all, ShutdownReport};
pub use worker::{WorkerFault, WorkerLifecycle, WorkerStatus, WorkerTask};
