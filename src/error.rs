//! Error types for voxrelay
//!
//! Runtime conditions (transport faults, cancellation) are turned into events by the
//! session layer. The variants here cover wiring mistakes and setup failures, which
//! are returned immediately to whoever attempted the operation.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum VoxError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(String),

    /// Publish or subscribe for a message type that was never enabled
    #[error("event type not enabled: {type_name}")]
    EventNotEnabled { type_name: &'static str },

    /// A message type was enabled twice on the same registry
    #[error("event type already enabled: {type_name}")]
    EventAlreadyEnabled { type_name: &'static str },

    /// Forwarding a registry into itself
    #[error("cannot forward events from a registry into itself")]
    EventSelfForward,

    #[error("worker '{label}' was already started")]
    WorkerAlreadyStarted { label: String },

    #[error("updates receiver is not running")]
    ReceiverNotRunning,

    #[error("audio input tasks already created")]
    AudioInputAlreadyStarted,

    /// A worker was asked to wait for its own completion
    #[error("worker '{label}' cannot be stopped from its own thread")]
    SelfJoin { label: String },
}

impl From<std::io::Error> for VoxError {
    fn from(e: std::io::Error) -> Self {
        VoxError::Io(e.to_string())
    }
}

impl VoxError {
    /// Check if this error is recoverable
    ///
    /// Wiring errors are never recoverable: they mean the components were
    /// connected in the wrong order or twice.
    pub fn is_recoverable(&self) -> bool {
        match self {
            VoxError::AudioDevice(_) => false,
            // Reconnecting may succeed
            VoxError::Transport(_) => true,
            VoxError::Config(_) => false,
            VoxError::Channel(_) => false,
            VoxError::Io(_) => false,
            VoxError::EventNotEnabled { .. }
            | VoxError::EventAlreadyEnabled { .. }
            | VoxError::EventSelfForward
            | VoxError::WorkerAlreadyStarted { .. }
            | VoxError::ReceiverNotRunning
            | VoxError::AudioInputAlreadyStarted
            | VoxError::SelfJoin { .. } => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            VoxError::AudioDevice(_) => {
                "Audio device error. Please check your microphone/speakers.".to_string()
            }
            VoxError::Transport(_) => {
                "Connection to the conversation service failed. Please try again.".to_string()
            }
            VoxError::Config(_) => "Configuration error. Please check settings.".to_string(),
            VoxError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            VoxError::Io(_) => "File system error occurred.".to_string(),
            _ => "Internal error. Please restart the application.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wiring_errors_are_not_recoverable() {
        let err = VoxError::EventNotEnabled { type_name: "Foo" };
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "event type not enabled: Foo");
    }

    #[test]
    fn test_transport_is_recoverable() {
        let err = VoxError::Transport("socket reset".into());
        assert!(err.is_recoverable());
        assert!(err.user_message().contains("Connection"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: VoxError = io.into();
        assert!(matches!(err, VoxError::Io(_)));
    }
}
