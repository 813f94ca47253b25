//! Conversation shell
//!
//! Wires devices, receiver and console for one session. Handlers that touch
//! shared session state run on the receiver's relay worker.

use crate::audio::output_task::{ItemAttributes, PlaybackPositionReached};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::runtime::cancel::CancelToken;
use crate::runtime::events::EventRegistry;
use crate::runtime::relay::EventRelay;
use crate::runtime::shutdown::{cancel_stop_dispose_all, ShutdownReport};
use crate::runtime::worker::WorkerTask;
use crate::session::cancellation::ConversationCancellation;
use crate::session::console::SessionConsole;
use crate::session::devices::ConversationDevices;
use crate::session::network::RealtimeClient;
use crate::session::receiver::UpdatesReceiver;
use crate::session::state::SessionSnapshot;
use crate::session::updates::{on_update, ConversationUpdate, UpdateKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// An item being streamed by the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamItem {
    pub attributes: ItemAttributes,
    pub function_name: Option<String>,
}

struct StreamItems {
    items: HashMap<String, StreamItem>,
    next_local_id: u64,
}

impl StreamItems {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
            next_local_id: 1,
        }
    }

    fn start(&mut self, item_id: &str, function_name: Option<String>) -> StreamItem {
        let item = StreamItem {
            attributes: ItemAttributes::new(item_id, self.next_local_id),
            function_name,
        };
        self.next_local_id += 1;
        self.items.insert(item_id.to_string(), item.clone());
        item
    }
}

pub struct ConversationShell {
    cancellation: Arc<ConversationCancellation>,
    devices: ConversationDevices,
    receiver: UpdatesReceiver,
    console: SessionConsole,
    items: Arc<Mutex<StreamItems>>,
    speech_started_at: Arc<Mutex<Option<Instant>>>,
}

impl ConversationShell {
    /// Build a shell; `external` (usually the interrupt signal) cancels the whole session
    pub fn new(config: SessionConfig, console: SessionConsole, external: Option<&CancelToken>) -> Result<Self> {
        let cancellation = Arc::new(ConversationCancellation::new(external));
        let devices = ConversationDevices::new(config.clone(), &cancellation)?;
        let receiver = UpdatesReceiver::new(
            config,
            Arc::clone(&cancellation),
            devices.microphone().clone(),
        )?;

        let shell = Self {
            cancellation,
            devices,
            receiver,
            console,
            items: Arc::new(Mutex::new(StreamItems::new())),
            speech_started_at: Arc::new(Mutex::new(None)),
        };
        shell.connect_device_handlers()?;
        shell.connect_update_handlers()?;
        shell.devices.start()?;
        Ok(shell)
    }

    fn connect_device_handlers(&self) -> Result<()> {
        let events = self.receiver.events();
        self.console.connect_receiver_events(events)?;
        self.console.connect_session_events(events)?;
        self.devices.connect_session_events(events)?;

        let items = Arc::clone(&self.items);
        let devices = self.devices.clone();
        self.devices.output_events().connect(EventRelay::to_handler(
            self.receiver.relay_queue(),
            move |reached: &PlaybackPositionReached| {
                items.lock().items.remove(&reached.item.item_id);
                if devices.clear_playback_item(&reached.item) {
                    debug!("Barge-in cleared item {:?}", reached.item.local_id);
                }
            },
        ))?;
        Ok(())
    }

    fn connect_update_handlers(&self) -> Result<()> {
        let events = self.receiver.events();

        let receiver = self.receiver.downgrade();
        on_update(events, UpdateKind::SessionStarted, move |_| {
            if let Some(receiver) = receiver.upgrade() {
                if let Err(e) = receiver.start_audio_input() {
                    warn!("Audio input not started: {}", e);
                }
            }
        })?;

        let started_at = Arc::clone(&self.speech_started_at);
        on_update(events, UpdateKind::InputSpeechStarted, move |_| {
            *started_at.lock() = Some(Instant::now());
        })?;

        let started_at = Arc::clone(&self.speech_started_at);
        on_update(events, UpdateKind::InputSpeechFinished, move |_| {
            if let Some(start) = started_at.lock().take() {
                debug!("User spoke for {} ms", start.elapsed().as_millis());
            }
        })?;

        let items = Arc::clone(&self.items);
        on_update(events, UpdateKind::ItemStreamingStarted, move |update| {
            if let ConversationUpdate::ItemStreamingStarted {
                item_id,
                function_name,
            } = update
            {
                let item = items.lock().start(item_id, function_name.clone());
                trace!("Streaming item {} as {:?}", item_id, item.attributes.local_id);
            }
        })?;

        let items = Arc::clone(&self.items);
        on_update(events, UpdateKind::ItemStreamingFinished, move |update| {
            if let Some(item_id) = update.item_id() {
                items.lock().items.remove(item_id);
            }
        })?;

        let items = Arc::clone(&self.items);
        let devices = self.devices.clone();
        on_update(events, UpdateKind::ItemStreamingPartDelta, move |update| {
            if let ConversationUpdate::ItemStreamingPartDelta {
                item_id,
                audio,
                transcript,
                ..
            } = update
            {
                let item = items.lock().items.get(item_id).cloned();
                match item {
                    Some(item) => devices.handle_streaming_delta(
                        &item.attributes,
                        audio.as_deref(),
                        transcript.as_deref(),
                    ),
                    None => trace!("Delta for unknown item {}", item_id),
                }
            }
        })?;
        Ok(())
    }

    pub fn connect(&self, client: &dyn RealtimeClient) -> Result<()> {
        self.receiver.connect(client)
    }

    /// Receive updates on the calling thread until the session ends
    pub fn run(&self) -> Result<()> {
        self.receiver.run()
    }

    pub fn run_background(&self) -> Result<WorkerTask> {
        self.receiver.run_background()
    }

    /// Stop capture, let the current response finish, then stop every worker
    ///
    /// Must not be called from a session handler: it waits for the relay worker.
    ///
    /// The whole sequence shares one `timeout`. The graceful steps (audio input
    /// drains, the current response finishes, the relay empties) may use at most
    /// half of it; whatever is still running then is canceled and gets the rest.
    /// Workers still running at the deadline are reported in
    /// [`ShutdownReport::TimedOut`].
    pub fn finish_session(&self, timeout: Duration) -> Result<ShutdownReport> {
        let started = Instant::now();
        let deadline = started + timeout;
        let graceful_deadline = started + timeout / 2;
        info!("Finishing session");

        self.cancellation.cancel_shell();
        // Audio input drains first so its last events reach the relay
        for task in [self.receiver.capture_task(), self.receiver.send_task()]
            .into_iter()
            .flatten()
        {
            if !task.wait(remaining(graceful_deadline)) {
                debug!("'{}' still running at shutdown", task.label());
            }
        }
        self.receiver.finish_receiver();
        if let Some(task) = self.receiver.receive_task() {
            if !task.wait(remaining(graceful_deadline)) {
                debug!("Response still in progress at shutdown, canceling the receive loop");
            }
        }

        let relay = self.receiver.relay();
        if relay.close() && !relay.wait(remaining(graceful_deadline)) {
            debug!("Relay still draining at shutdown");
        }
        self.cancellation.cancel_speech();

        let mut tasks = self.receiver.task_list();
        tasks.extend(self.devices.task_list());
        let report = match cancel_stop_dispose_all(&tasks, remaining(deadline))? {
            ShutdownReport::Completed { .. } => ShutdownReport::Completed {
                elapsed: started.elapsed(),
            },
            timed_out => timed_out,
        };

        match &report {
            ShutdownReport::Completed { elapsed } => {
                info!("Session finished in {} ms", elapsed.as_millis())
            }
            ShutdownReport::TimedOut { pending } => {
                warn!("Failed to cleanly stop: {}", pending.join(", "))
            }
        }
        Ok(report)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.receiver.snapshot()
    }

    /// Relayed session events
    pub fn events(&self) -> &Arc<EventRegistry> {
        self.receiver.events()
    }

    pub fn receiver(&self) -> &UpdatesReceiver {
        &self.receiver
    }

    pub fn devices(&self) -> &ConversationDevices {
        &self.devices
    }

    pub fn console(&self) -> &SessionConsole {
        &self.console
    }

    pub fn cancellation(&self) -> &Arc<ConversationCancellation> {
        &self.cancellation
    }

    /// Items currently streaming, by service id
    pub fn streaming_items(&self) -> Vec<StreamItem> {
        let mut items: Vec<StreamItem> = self.items.lock().items.values().cloned().collect();
        items.sort_by_key(|item| item.attributes.local_id);
        items
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}
