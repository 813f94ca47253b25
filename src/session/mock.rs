//! In-process network collaborator
//!
//! `MockSession` is fed by the test or demo through [`MockSession::push`]; it
//! records what the client sends and closes its update stream when asked to
//! close output, like a well-behaved server would.

use crate::config::SessionConfig;
use crate::session::network::{RealtimeClient, RealtimeSession, TransportError, UpdateStream};
use crate::session::updates::ConversationUpdate;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

type UpdateResult = Result<ConversationUpdate, TransportError>;

pub struct MockSession {
    tx: Mutex<Option<UnboundedSender<UpdateResult>>>,
    rx: Mutex<Option<UnboundedReceiver<UpdateResult>>>,
    open: AtomicBool,
    sent_audio: Mutex<Vec<u8>>,
    fail_send: AtomicBool,
    panic_send: AtomicBool,
    clears: AtomicUsize,
    interrupts: AtomicUsize,
    close_requests: AtomicUsize,
}

impl Default for MockSession {
    fn default() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            open: AtomicBool::new(true),
            sent_audio: Mutex::new(Vec::new()),
            fail_send: AtomicBool::new(false),
            panic_send: AtomicBool::new(false),
            clears: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            close_requests: AtomicUsize::new(0),
        }
    }
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an update to the client; `false` once the stream is closed
    pub fn push(&self, update: ConversationUpdate) -> bool {
        self.push_result(Ok(update))
    }

    /// Deliver a transport error to the client
    pub fn push_error(&self, error: TransportError) -> bool {
        self.push_result(Err(error))
    }

    fn push_result(&self, item: UpdateResult) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Push `script` from a background thread, pausing `gap` between updates
    pub fn play_script(self: &Arc<Self>, script: Vec<ConversationUpdate>, gap: Duration) -> thread::JoinHandle<()> {
        let session = Arc::clone(self);
        thread::spawn(move || {
            for update in script {
                if !session.push(update) {
                    break;
                }
                thread::sleep(gap);
            }
        })
    }

    /// Drop the connection from the server side
    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.tx.lock().take();
    }

    /// Make every following `send_input_audio` fail
    pub fn fail_sends(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    /// Make every following `send_input_audio` panic, like a crashing encoder
    pub fn panic_on_send(&self) {
        self.panic_send.store(true, Ordering::SeqCst);
    }

    pub fn sent_audio_len(&self) -> usize {
        self.sent_audio.lock().len()
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_requests.load(Ordering::SeqCst)
    }
}

impl RealtimeSession for MockSession {
    fn updates(&self) -> UpdateStream {
        let rx = self.rx.lock().take();
        Box::pin(async_stream::stream! {
            if let Some(mut rx) = rx {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            }
        })
    }

    fn send_input_audio(&self, audio: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if self.panic_send.load(Ordering::SeqCst) {
            panic!("audio encoder crashed");
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::Send("connection reset by peer".into()));
        }
        self.sent_audio.lock().extend_from_slice(audio);
        Ok(())
    }

    fn clear_input_audio(&self) -> Result<(), TransportError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn interrupt_response(&self) -> Result<(), TransportError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close_output(&self) -> Result<(), TransportError> {
        self.close_requests.fetch_add(1, Ordering::SeqCst);
        debug!("Mock session closing");
        self.disconnect();
        Ok(())
    }
}

/// Client handing out one prepared [`MockSession`]
pub struct MockClient {
    session: Arc<MockSession>,
    refuse: Option<String>,
}

impl MockClient {
    pub fn new(session: Arc<MockSession>) -> Self {
        Self {
            session,
            refuse: None,
        }
    }

    /// A client whose connection attempts always fail with `message`
    pub fn refusing(message: impl Into<String>) -> Self {
        Self {
            session: MockSession::new(),
            refuse: Some(message.into()),
        }
    }

    pub fn session(&self) -> &Arc<MockSession> {
        &self.session
    }
}

impl RealtimeClient for MockClient {
    fn start_session(&self, _config: &SessionConfig) -> Result<Arc<dyn RealtimeSession>, TransportError> {
        if let Some(message) = &self.refuse {
            return Err(TransportError::Connect(message.clone()));
        }
        let session: Arc<dyn RealtimeSession> = self.session.clone();
        Ok(session)
    }
}
