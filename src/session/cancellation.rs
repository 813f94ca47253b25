//! Cancellation signals of one conversation
//!
//! ```text
//! shell (root, optionally linked to an external token)
//! └── microphone
//! websocket
//! speech
//! ```

use crate::runtime::cancel::{CancelSource, CancelToken};
use tracing::debug;

pub struct ConversationCancellation {
    shell: CancelSource,
    microphone: CancelSource,
    websocket: CancelSource,
    speech: CancelSource,
}

impl ConversationCancellation {
    /// `external` is typically the process interrupt signal
    pub fn new(external: Option<&CancelToken>) -> Self {
        let shell = match external {
            Some(token) => CancelSource::linked("shell", token),
            None => CancelSource::new("shell"),
        };
        let microphone = CancelSource::linked("microphone", &shell.token());
        Self {
            shell,
            microphone,
            websocket: CancelSource::new("websocket"),
            speech: CancelSource::new("speech"),
        }
    }

    pub fn shell_token(&self) -> CancelToken {
        self.shell.token()
    }

    pub fn microphone_token(&self) -> CancelToken {
        self.microphone.token()
    }

    pub fn websocket_token(&self) -> CancelToken {
        self.websocket.token()
    }

    pub fn speech_token(&self) -> CancelToken {
        self.speech.token()
    }

    /// Cancel the whole shell subtree
    pub fn cancel_shell(&self) {
        if self.shell.cancel() {
            debug!("Shell canceled");
        }
    }

    /// Stop capture without touching anything else
    pub fn cancel_microphone(&self) -> bool {
        self.microphone.cancel()
    }

    pub fn cancel_websocket(&self) -> bool {
        self.websocket.cancel()
    }

    pub fn cancel_speech(&self) -> bool {
        self.speech.cancel()
    }

    pub fn is_microphone_cancelled(&self) -> bool {
        self.microphone.is_cancelled()
    }
}

impl Default for ConversationCancellation {
    fn default() -> Self {
        Self::new(None)
    }
}
