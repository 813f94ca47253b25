//! Updates receiver
//!
//! Owns the three session workers:
//! - `updates-receiver` pulls updates off the network and drives [`SessionLifecycle`]
//! - `capture-audio` moves fixed-size chunks from the microphone into staging
//! - `send-audio` pushes staged audio to the network
//!
//! Every update is published on a raw registry and forwarded through the relay
//! worker, so subscribers of [`UpdatesReceiver::events`] see one total order on one
//! thread. When both audio workers are done, the last of them cancels the
//! microphone signal, publishes [`AudioInputFinished`] and asks the receive loop to
//! finish after the current response.

use crate::audio::capture::MicrophoneStream;
use crate::audio::staging::AudioStagingBuffer;
use crate::config::SessionConfig;
use crate::error::{Result, VoxError};
use crate::runtime::cancel::{CancelSource, CancelToken};
use crate::runtime::events::{EventRegistry, Message};
use crate::runtime::fan_in::CompletionCounter;
use crate::runtime::relay::{RelayQueue, RelayWorker};
use crate::runtime::worker::{WorkerStatus, WorkerTask};
use crate::session::cancellation::ConversationCancellation;
use crate::session::network::{RealtimeClient, RealtimeSession, TransportError};
use crate::session::state::{
    LifecycleStep, ReceiverState, SessionLifecycle, SessionSnapshot, SharedSessionState,
};
use crate::session::updates::{
    enable_session_events, AudioInputFinished, CaptureFinished, ConversationUpdate,
    FailedToConnect, SendAudioFinished, SessionFault,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

pub const RECEIVE_TASK_LABEL: &str = "updates-receiver";
pub const SEND_TASK_LABEL: &str = "send-audio";
pub const CAPTURE_TASK_LABEL: &str = "capture-audio";

struct ReceiverInner {
    config: SessionConfig,
    cancellation: Arc<ConversationCancellation>,
    microphone: MicrophoneStream,
    session: Mutex<Option<Arc<dyn RealtimeSession>>>,
    relay: RelayWorker,
    raw: Arc<EventRegistry>,
    events: Arc<EventRegistry>,
    state: SharedSessionState,
    finish_requested: Notify,
    receive_task: Mutex<Option<WorkerTask>>,
    send_task: Mutex<Option<WorkerTask>>,
    capture_task: Mutex<Option<WorkerTask>>,
    audio_tasks: CompletionCounter,
}

#[derive(Clone)]
pub struct UpdatesReceiver {
    inner: Arc<ReceiverInner>,
}

/// Non-owning handle, for handlers living on the receiver's own registries
#[derive(Clone)]
pub(crate) struct WeakUpdatesReceiver {
    inner: Weak<ReceiverInner>,
}

impl WeakUpdatesReceiver {
    pub(crate) fn upgrade(&self) -> Option<UpdatesReceiver> {
        self.inner.upgrade().map(|inner| UpdatesReceiver { inner })
    }
}

impl UpdatesReceiver {
    /// Build the receiver and start its relay worker
    pub fn new(
        config: SessionConfig,
        cancellation: Arc<ConversationCancellation>,
        microphone: MicrophoneStream,
    ) -> Result<Self> {
        config.validate()?;

        let raw = Arc::new(EventRegistry::new());
        enable_session_events(&raw)?;

        let relay = RelayWorker::new(config.relay_label.clone())?;
        let events = Arc::new(EventRegistry::new());
        events.forward_all_from(&raw, relay.queue())?;
        relay.start()?;

        Ok(Self {
            inner: Arc::new(ReceiverInner {
                config,
                cancellation,
                microphone,
                session: Mutex::new(None),
                relay,
                raw,
                events,
                state: SharedSessionState::new(),
                finish_requested: Notify::new(),
                receive_task: Mutex::new(None),
                send_task: Mutex::new(None),
                capture_task: Mutex::new(None),
                audio_tasks: CompletionCounter::new(2),
            }),
        })
    }

    /// Start a session through `client`
    ///
    /// A refused connection is published as [`FailedToConnect`] and returned.
    pub fn connect(&self, client: &dyn RealtimeClient) -> Result<()> {
        match client.start_session(&self.inner.config) {
            Ok(session) => {
                info!("Session connected");
                self.attach_session(session);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to connect: {}", e);
                self.inner.publish(FailedToConnect {
                    message: e.to_string(),
                });
                Err(VoxError::Transport(e.to_string()))
            }
        }
    }

    pub(crate) fn downgrade(&self) -> WeakUpdatesReceiver {
        WeakUpdatesReceiver {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Use an already open session
    pub fn attach_session(&self, session: Arc<dyn RealtimeSession>) {
        *self.inner.session.lock() = Some(session);
    }

    /// Run the receive loop on the calling thread until the session disconnects
    pub fn run(&self) -> Result<()> {
        self.create_receive_task()?.start_synchronously()
    }

    /// Run the receive loop on its own worker
    pub fn run_background(&self) -> Result<WorkerTask> {
        let task = self.create_receive_task()?;
        task.start()?;
        Ok(task)
    }

    fn create_receive_task(&self) -> Result<WorkerTask> {
        let session = self
            .inner
            .session()
            .ok_or_else(|| VoxError::Transport("no session connected".to_string()))?;

        let mut slot = self.inner.receive_task.lock();
        if slot.is_some() {
            return Err(VoxError::WorkerAlreadyStarted {
                label: RECEIVE_TASK_LABEL.to_string(),
            });
        }

        let weak = Arc::downgrade(&self.inner);
        let task = WorkerTask::new(RECEIVE_TASK_LABEL, move |token| {
            match weak.upgrade() {
                Some(inner) => inner.receive(session, token),
                None => Ok(()),
            }
        });
        *slot = Some(task.clone());
        self.inner.state.mark_connected();
        Ok(task)
    }

    /// Create and start the send and capture workers
    ///
    /// Requires a running receive loop; only one pair per session.
    pub fn start_audio_input(&self) -> Result<()> {
        let receiving = self
            .inner
            .receive_task
            .lock()
            .as_ref()
            .map(|task| task.status() == WorkerStatus::Running)
            .unwrap_or(false);
        if !receiving {
            return Err(VoxError::ReceiverNotRunning);
        }
        let session = self.inner.session().ok_or(VoxError::ReceiverNotRunning)?;

        let config = &self.inner.config;
        // Canceled when capture ends so the send loop drains and stops
        let staging_source = CancelSource::linked(
            "audio-staging",
            &self.inner.cancellation.microphone_token(),
        );
        let staging = AudioStagingBuffer::with_min_read(
            config.audio_format,
            config.input_buffer_seconds,
            config.staging_min_read_ms,
            staging_source.token(),
        );

        let (send, capture) = {
            let mut send_slot = self.inner.send_task.lock();
            let mut capture_slot = self.inner.capture_task.lock();
            if send_slot.is_some() || capture_slot.is_some() {
                return Err(VoxError::AudioInputAlreadyStarted);
            }

            let send = {
                let weak = Arc::downgrade(&self.inner);
                let staging = staging.clone();
                WorkerTask::new(SEND_TASK_LABEL, move |token| {
                    if let Some(inner) = weak.upgrade() {
                        inner.send_audio(session.as_ref(), &staging, &token);
                    }
                    Ok(())
                })
            };
            let capture = {
                let weak = Arc::downgrade(&self.inner);
                WorkerTask::new(CAPTURE_TASK_LABEL, move |token| match weak.upgrade() {
                    Some(inner) => inner.capture_audio(&staging, &token),
                    None => Ok(()),
                })
            };

            self.inner.audio_tasks.reset(2);
            *send_slot = Some(send.clone());
            *capture_slot = Some(capture.clone());
            (send, capture)
        };

        let weak = Arc::downgrade(&self.inner);
        send.start_and_finish_with(move || {
            if let Some(inner) = weak.upgrade() {
                inner.publish(SendAudioFinished);
                inner.audio_task_finished(SEND_TASK_LABEL);
            }
        })?;

        let weak = Arc::downgrade(&self.inner);
        capture.start_and_finish_with(move || {
            staging_source.cancel();
            if let Some(inner) = weak.upgrade() {
                inner.publish(CaptureFinished);
                inner.audio_task_finished(CAPTURE_TASK_LABEL);
            }
        })?;

        info!("Audio input started");
        Ok(())
    }

    /// Ask the receive loop to finish once no response is in progress
    pub fn finish_receiver(&self) {
        debug!("Receiver finish requested");
        self.inner.finish_requested.notify_one();
    }

    /// Best-effort cancel of the response being generated
    pub fn interrupt_response(&self) -> bool {
        match self.inner.session() {
            Some(session) => self.inner.check_transport(session.interrupt_response()),
            None => false,
        }
    }

    /// Relayed session events; handlers run on the relay worker, in publish order
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.inner.events
    }

    pub fn relay(&self) -> &RelayWorker {
        &self.inner.relay
    }

    pub fn relay_queue(&self) -> &RelayQueue {
        self.inner.relay.queue()
    }

    pub fn state(&self) -> ReceiverState {
        self.inner.state.receiver_state()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.snapshot()
    }

    pub fn shared_state(&self) -> SharedSessionState {
        self.inner.state.clone()
    }

    pub fn cancellation(&self) -> &Arc<ConversationCancellation> {
        &self.inner.cancellation
    }

    pub fn receive_task(&self) -> Option<WorkerTask> {
        self.inner.receive_task.lock().clone()
    }

    pub fn send_task(&self) -> Option<WorkerTask> {
        self.inner.send_task.lock().clone()
    }

    pub fn capture_task(&self) -> Option<WorkerTask> {
        self.inner.capture_task.lock().clone()
    }

    /// Every worker this receiver created, relay included
    pub fn task_list(&self) -> Vec<WorkerTask> {
        let mut tasks = vec![self.inner.relay.worker().clone()];
        tasks.extend(self.receive_task());
        tasks.extend(self.send_task());
        tasks.extend(self.capture_task());
        tasks
    }
}

impl ReceiverInner {
    fn session(&self) -> Option<Arc<dyn RealtimeSession>> {
        self.session.lock().clone()
    }

    fn publish<M: Message>(&self, message: M) {
        if let Err(e) = self.raw.publish(message) {
            warn!("Session event dropped: {}", e);
        }
    }

    /// Publish a transport failure as [`SessionFault`]; `true` on success
    fn check_transport(&self, result: std::result::Result<(), TransportError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Transport fault: {}", e);
                self.publish(SessionFault {
                    message: e.to_string(),
                });
                false
            }
        }
    }

    fn receive(&self, session: Arc<dyn RealtimeSession>, token: CancelToken) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.receive_updates(session, token));
        Ok(())
    }

    async fn receive_updates(&self, session: Arc<dyn RealtimeSession>, token: CancelToken) {
        let mut lifecycle = SessionLifecycle::new();
        lifecycle.connect();
        self.state.publish(&lifecycle);

        let websocket = self.cancellation.websocket_token();
        let mut updates = session.updates();
        let mut close_requested = false;
        info!("Receiving conversation updates");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Receiver canceled");
                    break;
                }
                _ = websocket.cancelled() => {
                    debug!("Websocket canceled");
                    break;
                }
                _ = self.finish_requested.notified() => {
                    let interrupt = lifecycle.snapshot().response_in_progress;
                    if lifecycle.request_finish() && interrupt {
                        self.check_transport(session.interrupt_response());
                    }
                }
                next = updates.next() => match next {
                    Some(Ok(update)) => self.dispatch(&mut lifecycle, update),
                    Some(Err(e)) => {
                        warn!("Receive failed: {}", e);
                        self.publish(SessionFault {
                            message: e.to_string(),
                        });
                        break;
                    }
                    None => {
                        debug!("Update stream ended");
                        break;
                    }
                },
            }

            let step = lifecycle.advance(session.is_open());
            self.state.publish(&lifecycle);
            match step {
                LifecycleStep::Continue => {}
                LifecycleStep::CloseOutput => {
                    if !close_requested {
                        debug!("Closing session output");
                        close_requested = true;
                        if !self.check_transport(session.close_output()) {
                            break;
                        }
                    }
                }
                LifecycleStep::Exit => break,
            }
        }

        lifecycle.disconnect();
        self.state.publish(&lifecycle);
        if self.cancellation.cancel_microphone() {
            debug!("Microphone canceled on disconnect");
        }
        info!("Receiver disconnected");
    }

    fn dispatch(&self, lifecycle: &mut SessionLifecycle, update: ConversationUpdate) {
        if let ConversationUpdate::Unknown(tag) = &update {
            trace!("Ignoring update '{}'", tag);
            return;
        }
        lifecycle.observe(&update);
        if let ConversationUpdate::Error { message } = &update {
            warn!("Service error: {}", message);
        }
        trace!("Update {:?}", update.kind());
        self.publish(update);
    }

    /// Fails when the microphone stream is closed under a live capture
    fn capture_audio(&self, staging: &AudioStagingBuffer, token: &CancelToken) -> anyhow::Result<()> {
        let mut chunk = vec![0u8; self.config.capture_chunk_bytes];
        let mut captured = 0usize;
        while self.state.receiver_state().is_connected()
            && !self.microphone.is_cancelled()
            && !token.is_cancelled()
        {
            let read = self.microphone.read_exact_chunk_or(&mut chunk, token);
            if read == 0 {
                if self.microphone.is_closed() && !self.microphone.is_cancelled() && !token.is_cancelled() {
                    anyhow::bail!("microphone stream closed after {} bytes", captured);
                }
                break;
            }
            let written = staging.write(&chunk[..read]);
            if written < read {
                trace!("Staging full, {} bytes dropped", read - written);
            }
            captured += read;
        }
        debug!("Captured {} bytes of input audio", captured);
        Ok(())
    }

    fn send_audio(&self, session: &dyn RealtimeSession, staging: &AudioStagingBuffer, token: &CancelToken) {
        let mut buf = vec![0u8; self.config.capture_chunk_bytes];
        let mut sent = 0usize;
        while session.is_open() {
            let read = staging.read_or(&mut buf, token);
            if read == 0 {
                break;
            }
            if !self.check_transport(session.send_input_audio(&buf[..read])) {
                break;
            }
            sent += read;
        }
        if session.is_open() {
            self.check_transport(session.clear_input_audio());
        }
        debug!("Sent {} bytes of input audio", sent);
    }

    fn audio_task_finished(&self, label: &str) {
        if !self.audio_tasks.arrive() {
            debug!("'{}' finished, waiting for the other audio task", label);
            return;
        }
        self.cancellation.cancel_microphone();
        info!("Audio input finished");
        self.publish(AudioInputFinished);
        self.finish_requested.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::worker::WorkerLifecycle;
    use crate::session::mock::{MockClient, MockSession};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn receiver() -> UpdatesReceiver {
        let config = SessionConfig::default().with_relay_label("receiver-test-relay");
        let cancellation = Arc::new(ConversationCancellation::default());
        let microphone = MicrophoneStream::new(config.audio_format, cancellation.microphone_token());
        UpdatesReceiver::new(config, cancellation, microphone).unwrap()
    }

    fn record_updates(receiver: &UpdatesReceiver) -> Arc<Mutex<Vec<(ConversationUpdate, Option<String>)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        receiver
            .events()
            .subscribe::<ConversationUpdate, _>(move |update| {
                let thread = thread::current().name().map(str::to_string);
                sink.lock().push((update.clone(), thread));
            })
            .unwrap();
        seen
    }

    fn microphone_of(receiver: &UpdatesReceiver) -> MicrophoneStream {
        receiver.inner.microphone.clone()
    }

    #[test]
    fn test_audio_input_requires_running_receiver() {
        let receiver = receiver();
        let err = receiver.start_audio_input().unwrap_err();
        assert!(matches!(err, VoxError::ReceiverNotRunning));
    }

    #[test]
    fn test_refused_connection_is_published() {
        let receiver = receiver();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        receiver
            .events()
            .subscribe::<FailedToConnect, _>(move |failure| sink.lock().push(failure.message.clone()))
            .unwrap();

        let err = receiver
            .connect(&MockClient::refusing("handshake rejected"))
            .unwrap_err();
        assert!(matches!(err, VoxError::Transport(_)));
        assert!(wait_until(Duration::from_secs(5), || failures.lock().len() == 1));
        assert!(failures.lock()[0].contains("handshake rejected"));
    }

    #[test]
    fn test_updates_are_relayed_in_order() {
        let receiver = receiver();
        let session = MockSession::new();
        receiver.connect(&MockClient::new(Arc::clone(&session))).unwrap();
        let seen = record_updates(&receiver);

        let task = receiver.run_background().unwrap();
        session.push(ConversationUpdate::SessionStarted {
            session_id: "sess_1".into(),
        });
        session.push(ConversationUpdate::Unknown("conversation.item.mystery".into()));
        session.push(ConversationUpdate::InputAudioCleared);
        session.disconnect();

        assert!(task.wait(Duration::from_secs(5)));
        assert_eq!(receiver.state(), ReceiverState::Disconnected);
        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 2));

        let seen = seen.lock();
        assert!(matches!(seen[0].0, ConversationUpdate::SessionStarted { .. }));
        assert_eq!(seen[1].0, ConversationUpdate::InputAudioCleared);
        for (_, thread) in seen.iter() {
            assert_eq!(thread.as_deref(), Some("receiver-test-relay"));
        }
        assert!(receiver.snapshot().session_started);
    }

    #[test]
    fn test_finish_waits_for_response_then_closes() {
        let receiver = receiver();
        let session = MockSession::new();
        receiver.connect(&MockClient::new(Arc::clone(&session))).unwrap();
        let task = receiver.run_background().unwrap();

        session.push(ConversationUpdate::ResponseStarted {
            response_id: "resp_1".into(),
        });
        assert!(wait_until(Duration::from_secs(5), || {
            receiver.snapshot().response_in_progress
        }));

        receiver.finish_receiver();
        assert!(wait_until(Duration::from_secs(5), || {
            receiver.state() == ReceiverState::FinishAfterResponse
        }));
        assert_eq!(session.interrupt_count(), 1);
        assert_eq!(session.close_count(), 0);

        session.push(ConversationUpdate::ResponseFinished {
            response_id: "resp_1".into(),
        });
        assert!(task.wait(Duration::from_secs(5)));
        assert_eq!(session.close_count(), 1);
        assert_eq!(receiver.snapshot().responses_finished, 1);
    }

    #[test]
    fn test_transport_error_publishes_fault_and_stops() {
        let receiver = receiver();
        let session = MockSession::new();
        receiver.connect(&MockClient::new(Arc::clone(&session))).unwrap();
        let faults = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&faults);
        receiver
            .events()
            .subscribe::<SessionFault, _>(move |_| *sink.lock() += 1)
            .unwrap();

        let task = receiver.run_background().unwrap();
        session.push_error(TransportError::Receive("socket reset".into()));
        assert!(task.wait(Duration::from_secs(5)));
        assert!(wait_until(Duration::from_secs(5), || *faults.lock() == 1));
        assert!(receiver.cancellation().is_microphone_cancelled());
    }

    #[test]
    fn test_audio_round_trip_and_fan_in() {
        let receiver = receiver();
        let session = MockSession::new();
        receiver.connect(&MockClient::new(Arc::clone(&session))).unwrap();
        let finished = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&finished);
        receiver
            .events()
            .subscribe::<AudioInputFinished, _>(move |_| *sink.lock() += 1)
            .unwrap();

        let task = receiver.run_background().unwrap();
        receiver.start_audio_input().unwrap();
        assert!(matches!(
            receiver.start_audio_input().unwrap_err(),
            VoxError::AudioInputAlreadyStarted
        ));

        let microphone = microphone_of(&receiver);
        microphone.write(&vec![1u8; 4096 * 3]);
        assert!(wait_until(Duration::from_secs(5), || {
            session.sent_audio_len() == 4096 * 3
        }));

        receiver.cancellation().cancel_microphone();
        assert!(task.wait(Duration::from_secs(5)));
        for worker in [receiver.send_task(), receiver.capture_task()] {
            assert!(worker.unwrap().wait(Duration::from_secs(5)));
        }
        assert!(wait_until(Duration::from_secs(5), || *finished.lock() == 1));
        assert_eq!(session.clear_count(), 1);
        assert_eq!(session.close_count(), 1);
        assert_eq!(receiver.state(), ReceiverState::Disconnected);
    }

    #[test]
    fn test_task_list_includes_relay() {
        let receiver = receiver();
        let session = MockSession::new();
        receiver.connect(&MockClient::new(Arc::clone(&session))).unwrap();
        let task = receiver.run_background().unwrap();
        let labels: Vec<String> = receiver
            .task_list()
            .iter()
            .map(|task| task.label().to_string())
            .collect();
        assert_eq!(labels, vec!["receiver-test-relay", RECEIVE_TASK_LABEL]);

        let started = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&started);
        task.events()
            .subscribe::<WorkerLifecycle, _>(move |_| *flag.lock() = true)
            .unwrap();
        task.cancel();
        assert!(task.wait(Duration::from_secs(5)));
        assert!(*started.lock());
    }
}
