//! Session lifecycle state machine
//!
//! `SessionLifecycle` is owned by the receive loop and only ever mutated there.
//! Everyone else reads the [`SessionSnapshot`] it publishes after each update.
//!
//! ```text
//! Connected ──finish──▶ FinishAfterResponse ──no response──▶ Disconnecting ──closed──▶ Disconnected
//! ```

use crate::session::updates::ConversationUpdate;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Receive loop state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiverState {
    Connected,
    /// Keep receiving until the response in progress finishes
    FinishAfterResponse,
    /// Close requested, waiting for the connection to report closed
    Disconnecting,
    #[default]
    Disconnected,
}

impl ReceiverState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ReceiverState::Connected)
    }
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverState::Connected => write!(f, "Connected"),
            ReceiverState::FinishAfterResponse => write!(f, "FinishAfterResponse"),
            ReceiverState::Disconnecting => write!(f, "Disconnecting"),
            ReceiverState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Bookkeeping of one session, copied out after every processed update
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub receiver_state: ReceiverState,
    pub session_started: bool,
    pub response_in_progress: bool,
    pub speech_in_progress: bool,
    pub streaming_in_progress: bool,
    pub waiting_transcription: bool,
    pub input_audio_cleared: u32,
    pub responses_started: u32,
    pub responses_finished: u32,
    pub speech_started: u32,
    pub speech_finished: u32,
    pub streaming_started: u32,
    pub streaming_finished: u32,
    pub transcriptions_failed: u32,
    pub transcriptions_finished: u32,
}

/// What the receive loop should do after a step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleStep {
    Continue,
    /// Ask the connection to close gracefully, then keep receiving
    CloseOutput,
    Exit,
}

#[derive(Debug, Default)]
pub struct SessionLifecycle {
    record: SessionSnapshot,
}

impl SessionLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ReceiverState {
        self.record.receiver_state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.record.clone()
    }

    pub fn connect(&mut self) {
        self.transition(ReceiverState::Connected);
    }

    pub fn disconnect(&mut self) {
        self.transition(ReceiverState::Disconnected);
    }

    /// Fold one inbound update into the bookkeeping
    pub fn observe(&mut self, update: &ConversationUpdate) {
        let record = &mut self.record;
        match update {
            ConversationUpdate::SessionStarted { .. } => record.session_started = true,
            ConversationUpdate::InputAudioCleared => {
                record.input_audio_cleared += 1;
                record.speech_in_progress = false;
                record.waiting_transcription = false;
            }
            ConversationUpdate::InputSpeechStarted { .. } => {
                record.speech_started += 1;
                record.speech_in_progress = true;
            }
            ConversationUpdate::InputSpeechFinished { .. } => {
                record.speech_finished += 1;
                record.speech_in_progress = false;
                record.waiting_transcription = true;
            }
            ConversationUpdate::InputTranscriptionFailed { .. } => {
                record.transcriptions_failed += 1;
                record.waiting_transcription = false;
            }
            ConversationUpdate::InputTranscriptionFinished { .. } => {
                record.transcriptions_finished += 1;
                record.waiting_transcription = false;
            }
            ConversationUpdate::ItemStreamingStarted { .. } => {
                record.streaming_started += 1;
                record.streaming_in_progress = true;
            }
            ConversationUpdate::ItemStreamingFinished { .. } => {
                record.streaming_finished += 1;
                record.streaming_in_progress = false;
            }
            ConversationUpdate::ResponseStarted { .. } => {
                record.responses_started += 1;
                record.response_in_progress = true;
            }
            ConversationUpdate::ResponseFinished { .. } => {
                record.responses_finished += 1;
                record.response_in_progress = false;
            }
            _ => {}
        }
    }

    /// Ask to finish once the current response is done
    ///
    /// Only a connected session changes state; returns whether it did.
    pub fn request_finish(&mut self) -> bool {
        if self.record.receiver_state == ReceiverState::Connected {
            self.transition(ReceiverState::FinishAfterResponse);
            true
        } else {
            false
        }
    }

    /// Decide what the receive loop does next
    pub fn advance(&mut self, socket_open: bool) -> LifecycleStep {
        if self.record.receiver_state == ReceiverState::FinishAfterResponse {
            if self.record.response_in_progress {
                return LifecycleStep::Continue;
            }
            self.transition(ReceiverState::Disconnecting);
        }

        match self.record.receiver_state {
            ReceiverState::Connected | ReceiverState::FinishAfterResponse => LifecycleStep::Continue,
            ReceiverState::Disconnecting if socket_open => LifecycleStep::CloseOutput,
            ReceiverState::Disconnecting | ReceiverState::Disconnected => {
                self.transition(ReceiverState::Disconnected);
                LifecycleStep::Exit
            }
        }
    }

    fn transition(&mut self, next: ReceiverState) {
        if self.record.receiver_state != next {
            debug!("Receiver state {} -> {}", self.record.receiver_state, next);
            self.record.receiver_state = next;
        }
    }
}

/// Read side of the published snapshot
#[derive(Clone, Default)]
pub struct SharedSessionState {
    inner: Arc<RwLock<SessionSnapshot>>,
}

impl SharedSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.read().clone()
    }

    pub fn receiver_state(&self) -> ReceiverState {
        self.inner.read().receiver_state
    }

    /// Show `Connected` before the receive loop takes its first step
    pub(crate) fn mark_connected(&self) {
        self.inner.write().receiver_state = ReceiverState::Connected;
    }

    pub(crate) fn publish(&self, lifecycle: &SessionLifecycle) {
        *self.inner.write() = lifecycle.snapshot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_started() -> ConversationUpdate {
        ConversationUpdate::ResponseStarted {
            response_id: "resp_1".into(),
        }
    }

    fn response_finished() -> ConversationUpdate {
        ConversationUpdate::ResponseFinished {
            response_id: "resp_1".into(),
        }
    }

    #[test]
    fn test_connected_continues() {
        let mut lifecycle = SessionLifecycle::new();
        lifecycle.connect();
        lifecycle.observe(&response_started());
        assert_eq!(lifecycle.advance(true), LifecycleStep::Continue);
        assert_eq!(lifecycle.state(), ReceiverState::Connected);
    }

    #[test]
    fn test_finish_waits_for_response() {
        let mut lifecycle = SessionLifecycle::new();
        lifecycle.connect();
        lifecycle.observe(&response_started());
        assert!(lifecycle.request_finish());

        assert_eq!(lifecycle.advance(true), LifecycleStep::Continue);
        assert_eq!(lifecycle.state(), ReceiverState::FinishAfterResponse);

        lifecycle.observe(&ConversationUpdate::ItemStreamingFinished {
            item_id: "item_1".into(),
        });
        assert_eq!(lifecycle.advance(true), LifecycleStep::Continue);
        assert_eq!(lifecycle.state(), ReceiverState::FinishAfterResponse);

        lifecycle.observe(&response_finished());
        assert_eq!(lifecycle.advance(true), LifecycleStep::CloseOutput);
        assert_eq!(lifecycle.state(), ReceiverState::Disconnecting);

        assert_eq!(lifecycle.advance(false), LifecycleStep::Exit);
        assert_eq!(lifecycle.state(), ReceiverState::Disconnected);
    }

    #[test]
    fn test_finish_without_response_disconnects_immediately() {
        let mut lifecycle = SessionLifecycle::new();
        lifecycle.connect();
        lifecycle.request_finish();
        assert_eq!(lifecycle.advance(false), LifecycleStep::Exit);
    }

    #[test]
    fn test_finish_only_from_connected() {
        let mut lifecycle = SessionLifecycle::new();
        assert!(!lifecycle.request_finish());
        lifecycle.connect();
        assert!(lifecycle.request_finish());
        assert!(!lifecycle.request_finish());
    }

    #[test]
    fn test_bookkeeping() {
        let mut lifecycle = SessionLifecycle::new();
        lifecycle.observe(&ConversationUpdate::SessionStarted {
            session_id: "sess_1".into(),
        });
        lifecycle.observe(&ConversationUpdate::InputSpeechStarted {
            item_id: "item_1".into(),
            audio_start_ms: 0,
        });
        lifecycle.observe(&ConversationUpdate::InputSpeechFinished {
            item_id: "item_1".into(),
            audio_end_ms: 900,
        });

        let snapshot = lifecycle.snapshot();
        assert!(snapshot.session_started);
        assert!(!snapshot.speech_in_progress);
        assert!(snapshot.waiting_transcription);

        lifecycle.observe(&ConversationUpdate::InputTranscriptionFinished {
            item_id: "item_1".into(),
            transcript: "hello".into(),
        });
        lifecycle.observe(&ConversationUpdate::InputAudioCleared);
        let snapshot = lifecycle.snapshot();
        assert!(!snapshot.waiting_transcription);
        assert_eq!(snapshot.transcriptions_finished, 1);
        assert_eq!(snapshot.input_audio_cleared, 1);
    }

    #[test]
    fn test_shared_state_publishes_copies() {
        let shared = SharedSessionState::new();
        let mut lifecycle = SessionLifecycle::new();
        lifecycle.connect();
        shared.publish(&lifecycle);
        lifecycle.disconnect();
        assert_eq!(shared.receiver_state(), ReceiverState::Connected);
    }
}
