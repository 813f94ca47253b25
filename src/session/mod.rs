//! Conversation session: network interface, receive loop, devices, console, shell

pub mod cancellation;
pub mod console;
pub mod devices;
pub mod mock;
pub mod network;
pub mod receiver;
pub mod shell;
pub mod state;
pub mod updates;

pub use cancellation::ConversationCancellation;
pub use console::{ConsoleBuffer, SessionConsole};
pub use devices::ConversationDevices;
pub use mock::{MockClient, MockSession};
pub use network::{RealtimeClient, RealtimeSession, TransportError, UpdateStream};
pub use receiver::UpdatesReceiver;
pub use shell::{ConversationShell, StreamItem};
pub use state::{LifecycleStep, ReceiverState, SessionLifecycle, SessionSnapshot, SharedSessionState};
pub use updates::{
    on_update, AudioInputFinished, CaptureFinished, ConversationUpdate, FailedToConnect,
    SendAudioFinished, SessionFault, UpdateKind,
};
