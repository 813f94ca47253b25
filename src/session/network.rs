//! Network collaborator interface
//!
//! The realtime wire protocol lives outside this crate. A client starts sessions;
//! a session yields an asynchronous stream of updates and accepts audio.

use crate::config::SessionConfig;
use crate::session::updates::ConversationUpdate;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed")]
    Closed,
}

pub type UpdateStream = BoxStream<'static, Result<ConversationUpdate, TransportError>>;

/// One open conversation
pub trait RealtimeSession: Send + Sync {
    /// Stream of inbound updates; only the first call yields anything
    fn updates(&self) -> UpdateStream;

    fn send_input_audio(&self, audio: &[u8]) -> Result<(), TransportError>;

    fn clear_input_audio(&self) -> Result<(), TransportError>;

    fn interrupt_response(&self) -> Result<(), TransportError>;

    /// Whether the underlying connection can still send
    fn is_open(&self) -> bool;

    /// Request a graceful close; the update stream ends once the peer confirms
    fn close_output(&self) -> Result<(), TransportError>;
}

pub trait RealtimeClient: Send + Sync {
    fn start_session(&self, config: &SessionConfig) -> Result<Arc<dyn RealtimeSession>, TransportError>;
}
