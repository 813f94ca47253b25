//! Transcript console
//!
//! Renders relayed session events as text. Subscribe it to the relayed registry so
//! every line is written from the relay worker, in event order.

use crate::error::Result;
use crate::runtime::events::EventRegistry;
use crate::session::updates::{
    on_update, ConversationUpdate, FailedToConnect, SendAudioFinished, SessionFault, UpdateKind,
};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::warn;

pub const SESSION_STARTED_BANNER: &str = " *\n * Session started (Ctrl-C to finish)\n *";
pub const SESSION_FINISHED_BANNER: &str = "Audio input stream is stopped\nSESSION FINISHED";

struct ConsoleSink {
    out: Box<dyn Write + Send>,
    /// Agent text was written without a trailing newline
    line_open: bool,
}

#[derive(Clone)]
pub struct SessionConsole {
    sink: Arc<Mutex<ConsoleSink>>,
}

impl SessionConsole {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(ConsoleSink {
                out: Box::new(out),
                line_open: false,
            })),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn connect_session_events(&self, events: &EventRegistry) -> Result<()> {
        let console = self.clone();
        on_update(events, UpdateKind::SessionStarted, move |_| {
            console.write_line(SESSION_STARTED_BANNER)
        })?;

        let console = self.clone();
        on_update(events, UpdateKind::ResponseStarted, move |update| {
            if let ConversationUpdate::ResponseStarted { response_id } = update {
                console.item_started(response_id);
            }
        })?;

        let console = self.clone();
        on_update(events, UpdateKind::ResponseFinished, move |_| console.item_finished())?;

        let console = self.clone();
        on_update(events, UpdateKind::InputTranscriptionFinished, move |update| {
            if let ConversationUpdate::InputTranscriptionFinished { transcript, .. } = update {
                if !transcript.trim().is_empty() {
                    console.write_line(&format!("User: {}", transcript.trim()));
                }
            }
        })?;

        let console = self.clone();
        on_update(events, UpdateKind::InputTranscriptionFailed, move |update| {
            if let ConversationUpdate::InputTranscriptionFailed { message, .. } = update {
                if !message.is_empty() {
                    console.write_line(&format!("User: [transcription failed: {}]", message));
                }
            }
        })?;

        let console = self.clone();
        on_update(events, UpdateKind::ItemStreamingPartDelta, move |update| {
            if let ConversationUpdate::ItemStreamingPartDelta {
                transcript: Some(text),
                ..
            } = update
            {
                console.write_agent(text);
            }
        })?;

        let console = self.clone();
        on_update(events, UpdateKind::Error, move |update| {
            if let ConversationUpdate::Error { message } = update {
                console.write_error(message);
            }
        })?;

        let console = self.clone();
        events.subscribe::<SessionFault, _>(move |fault| console.write_error(&fault.message))?;

        let console = self.clone();
        events.subscribe::<SendAudioFinished, _>(move |_| console.write_line(SESSION_FINISHED_BANNER))?;
        Ok(())
    }

    /// Connection failures are reported before any session event exists
    pub fn connect_receiver_events(&self, events: &EventRegistry) -> Result<()> {
        let console = self.clone();
        events.subscribe::<FailedToConnect, _>(move |failure| console.write_error(&failure.message))
    }

    pub fn item_started(&self, response_id: &str) {
        self.write_line(&format!("Agent ({}):", response_id));
    }

    pub fn item_finished(&self) {
        self.with_sink(|sink| {
            if sink.line_open {
                sink.line_open = false;
                writeln!(sink.out)?;
            }
            Ok(())
        });
    }

    pub fn write_agent(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.with_sink(|sink| {
            sink.line_open = true;
            write!(sink.out, "{}", text)
        });
    }

    pub fn write_error(&self, message: &str) {
        self.write_line(&format!("Error: {}", message));
    }

    pub fn write_line(&self, line: &str) {
        self.with_sink(|sink| {
            if sink.line_open {
                sink.line_open = false;
                writeln!(sink.out)?;
            }
            writeln!(sink.out, "{}", line)
        });
    }

    fn with_sink(&self, f: impl FnOnce(&mut ConsoleSink) -> io::Result<()>) {
        let mut sink = self.sink.lock();
        if let Err(e) = f(&mut sink).and_then(|_| sink.out.flush()) {
            warn!("Console write failed: {}", e);
        }
    }
}

/// Shared in-memory console sink
#[derive(Clone, Default)]
pub struct ConsoleBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl ConsoleBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }
}

impl Write for ConsoleBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
