//! Conversation updates and session-level events
//!
//! The network collaborator yields [`ConversationUpdate`]s, a closed tagged union.
//! All kinds travel through registries as one message type; subscribers pick the
//! kinds they care about with [`on_update`].

use crate::error::Result;
use crate::runtime::events::EventRegistry;

#[derive(Debug, Clone, PartialEq)]
pub enum ConversationUpdate {
    SessionStarted { session_id: String },
    SessionConfigured,
    InputAudioCleared,
    InputAudioCommitted { item_id: String },
    ItemCreated { item_id: String },
    ItemDeleted { item_id: String },
    ItemTruncated { item_id: String, audio_end_ms: u64 },
    Error { message: String },
    RateLimits,
    InputSpeechStarted { item_id: String, audio_start_ms: u64 },
    InputSpeechFinished { item_id: String, audio_end_ms: u64 },
    InputTranscriptionFailed { item_id: String, message: String },
    InputTranscriptionFinished { item_id: String, transcript: String },
    ItemStreamingStarted {
        item_id: String,
        function_name: Option<String>,
    },
    ItemStreamingFinished { item_id: String },
    ItemStreamingPartDelta {
        item_id: String,
        audio: Option<Vec<u8>>,
        transcript: Option<String>,
        text: Option<String>,
    },
    ItemStreamingPartFinished { item_id: String },
    ItemStreamingAudioFinished { item_id: String },
    ItemStreamingAudioTranscriptionFinished { item_id: String, transcript: String },
    ItemStreamingTextFinished { item_id: String, text: String },
    ResponseStarted { response_id: String },
    ResponseFinished { response_id: String },
    /// A tag this client does not know; ignored
    Unknown(String),
}

/// Tag of a [`ConversationUpdate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    SessionStarted,
    SessionConfigured,
    InputAudioCleared,
    InputAudioCommitted,
    ItemCreated,
    ItemDeleted,
    ItemTruncated,
    Error,
    RateLimits,
    InputSpeechStarted,
    InputSpeechFinished,
    InputTranscriptionFailed,
    InputTranscriptionFinished,
    ItemStreamingStarted,
    ItemStreamingFinished,
    ItemStreamingPartDelta,
    ItemStreamingPartFinished,
    ItemStreamingAudioFinished,
    ItemStreamingAudioTranscriptionFinished,
    ItemStreamingTextFinished,
    ResponseStarted,
    ResponseFinished,
    Unknown,
}

impl ConversationUpdate {
    pub fn kind(&self) -> UpdateKind {
        match self {
            ConversationUpdate::SessionStarted { .. } => UpdateKind::SessionStarted,
            ConversationUpdate::SessionConfigured => UpdateKind::SessionConfigured,
            ConversationUpdate::InputAudioCleared => UpdateKind::InputAudioCleared,
            ConversationUpdate::InputAudioCommitted { .. } => UpdateKind::InputAudioCommitted,
            ConversationUpdate::ItemCreated { .. } => UpdateKind::ItemCreated,
            ConversationUpdate::ItemDeleted { .. } => UpdateKind::ItemDeleted,
            ConversationUpdate::ItemTruncated { .. } => UpdateKind::ItemTruncated,
            ConversationUpdate::Error { .. } => UpdateKind::Error,
            ConversationUpdate::RateLimits => UpdateKind::RateLimits,
            ConversationUpdate::InputSpeechStarted { .. } => UpdateKind::InputSpeechStarted,
            ConversationUpdate::InputSpeechFinished { .. } => UpdateKind::InputSpeechFinished,
            ConversationUpdate::InputTranscriptionFailed { .. } => {
                UpdateKind::InputTranscriptionFailed
            }
            ConversationUpdate::InputTranscriptionFinished { .. } => {
                UpdateKind::InputTranscriptionFinished
            }
            ConversationUpdate::ItemStreamingStarted { .. } => UpdateKind::ItemStreamingStarted,
            ConversationUpdate::ItemStreamingFinished { .. } => UpdateKind::ItemStreamingFinished,
            ConversationUpdate::ItemStreamingPartDelta { .. } => UpdateKind::ItemStreamingPartDelta,
            ConversationUpdate::ItemStreamingPartFinished { .. } => {
                UpdateKind::ItemStreamingPartFinished
            }
            ConversationUpdate::ItemStreamingAudioFinished { .. } => {
                UpdateKind::ItemStreamingAudioFinished
            }
            ConversationUpdate::ItemStreamingAudioTranscriptionFinished { .. } => {
                UpdateKind::ItemStreamingAudioTranscriptionFinished
            }
            ConversationUpdate::ItemStreamingTextFinished { .. } => {
                UpdateKind::ItemStreamingTextFinished
            }
            ConversationUpdate::ResponseStarted { .. } => UpdateKind::ResponseStarted,
            ConversationUpdate::ResponseFinished { .. } => UpdateKind::ResponseFinished,
            ConversationUpdate::Unknown(_) => UpdateKind::Unknown,
        }
    }

    /// Service item the update refers to, if any
    pub fn item_id(&self) -> Option<&str> {
        match self {
            ConversationUpdate::InputAudioCommitted { item_id }
            | ConversationUpdate::ItemCreated { item_id }
            | ConversationUpdate::ItemDeleted { item_id }
            | ConversationUpdate::ItemTruncated { item_id, .. }
            | ConversationUpdate::InputSpeechStarted { item_id, .. }
            | ConversationUpdate::InputSpeechFinished { item_id, .. }
            | ConversationUpdate::InputTranscriptionFailed { item_id, .. }
            | ConversationUpdate::InputTranscriptionFinished { item_id, .. }
            | ConversationUpdate::ItemStreamingStarted { item_id, .. }
            | ConversationUpdate::ItemStreamingFinished { item_id }
            | ConversationUpdate::ItemStreamingPartDelta { item_id, .. }
            | ConversationUpdate::ItemStreamingPartFinished { item_id }
            | ConversationUpdate::ItemStreamingAudioFinished { item_id }
            | ConversationUpdate::ItemStreamingAudioTranscriptionFinished { item_id, .. }
            | ConversationUpdate::ItemStreamingTextFinished { item_id, .. } => Some(item_id),
            _ => None,
        }
    }
}

/// Subscribe `handler` to updates of one kind
pub fn on_update<F>(registry: &EventRegistry, kind: UpdateKind, handler: F) -> Result<()>
where
    F: Fn(&ConversationUpdate) + Send + Sync + 'static,
{
    registry.subscribe::<ConversationUpdate, _>(move |update| {
        if update.kind() == kind {
            handler(update);
        }
    })
}

/// Transport fault while the session was running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFault {
    pub message: String,
}

/// The session could not be started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedToConnect {
    pub message: String,
}

/// The send worker finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendAudioFinished;

/// The capture worker finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFinished;

/// Both audio workers finished; published exactly once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInputFinished;

/// Enable every session-level message type on `registry`
pub fn enable_session_events(registry: &EventRegistry) -> Result<()> {
    registry.enable::<ConversationUpdate>()?;
    registry.enable::<SessionFault>()?;
    registry.enable::<FailedToConnect>()?;
    registry.enable::<SendAudioFinished>()?;
    registry.enable::<CaptureFinished>()?;
    registry.enable::<AudioInputFinished>()?;
    Ok(())
}
