//! Conversation devices
//!
//! Microphone and speaker streams of one session, plus playback item tracking.
//! Audio chunks arrive as streaming deltas tagged with an item; only the newest
//! item is played, and once an item is cleared its remaining chunks are dropped.

use crate::audio::capture::MicrophoneStream;
use crate::audio::output_task::{ItemAttributes, SessionAudioOutput};
use crate::audio::playback::SpeakerStream;
use crate::config::SessionConfig;
use crate::error::Result;
use crate::runtime::events::EventRegistry;
use crate::runtime::worker::WorkerTask;
use crate::session::cancellation::ConversationCancellation;
use crate::session::updates::{on_update, UpdateKind};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

const NORMAL_VOLUME: f32 = 1.0;

#[derive(Default)]
struct PlaybackItems {
    enqueued: ItemAttributes,
    cleared: ItemAttributes,
}

struct DevicesInner {
    config: SessionConfig,
    output: SessionAudioOutput,
    microphone: MicrophoneStream,
    items: Mutex<PlaybackItems>,
}

#[derive(Clone)]
pub struct ConversationDevices {
    inner: Arc<DevicesInner>,
}

impl ConversationDevices {
    /// Create the streams; the speaker follows the speech signal, the microphone its own
    pub fn new(config: SessionConfig, cancellation: &ConversationCancellation) -> Result<Self> {
        let format = config.audio_format;
        let speaker = SpeakerStream::with_limits(
            format,
            config.speaker_buffer_seconds,
            config.playback_warmup_ms,
            cancellation.speech_token(),
        );
        let output = SessionAudioOutput::new(speaker, config.output_poll_interval())?;
        let microphone = MicrophoneStream::with_seconds(
            format,
            config.microphone_buffer_seconds,
            cancellation.microphone_token(),
        );

        Ok(Self {
            inner: Arc::new(DevicesInner {
                config,
                output,
                microphone,
                items: Mutex::new(PlaybackItems::default()),
            }),
        })
    }

    /// Start the playback monitor; capture starts once the service confirms the session
    pub fn start(&self) -> Result<()> {
        self.inner.output.start()
    }

    pub fn microphone(&self) -> &MicrophoneStream {
        &self.inner.microphone
    }

    pub fn speaker(&self) -> &SpeakerStream {
        self.inner.output.speaker()
    }

    pub fn output(&self) -> &SessionAudioOutput {
        &self.inner.output
    }

    /// Registry of the playback monitor
    pub fn output_events(&self) -> &Arc<EventRegistry> {
        self.inner.output.events()
    }

    /// Duck playback while the user speaks, and arm the barge-in marker
    pub fn connect_session_events(&self, events: &EventRegistry) -> Result<()> {
        let devices = self.clone();
        on_update(events, UpdateKind::InputSpeechStarted, move |_| {
            devices.set_position_marker(devices.inner.config.clear_enqueued_timeout_ms);
            devices.adjust_speaker_volume(devices.inner.config.volume_ratio_during_speech);
        })?;

        let devices = self.clone();
        on_update(events, UpdateKind::InputSpeechFinished, move |_| {
            devices.reset_speaker_volume();
            devices.reset_position_marker();
        })?;
        Ok(())
    }

    pub fn adjust_speaker_volume(&self, ratio: f32) {
        self.inner.output.set_volume(NORMAL_VOLUME * ratio);
    }

    pub fn reset_speaker_volume(&self) {
        self.inner.output.set_volume(NORMAL_VOLUME);
    }

    /// Arm the marker `delay_ms` past the current position, for the enqueued item
    pub fn set_position_marker(&self, delay_ms: u64) {
        let enqueued = self.inner.items.lock().enqueued.clone();
        self.inner.output.set_position_marker(delay_ms, &enqueued);
    }

    pub fn reset_position_marker(&self) {
        self.inner.output.reset_position_marker();
    }

    pub fn buffered_ms(&self) -> u64 {
        self.speaker().buffered_ms()
    }

    pub fn enqueued_item(&self) -> ItemAttributes {
        self.inner.items.lock().enqueued.clone()
    }

    pub fn cleared_item(&self) -> ItemAttributes {
        self.inner.items.lock().cleared.clone()
    }

    /// Clear playback of `item` if it is the enqueued one and was not cleared yet
    pub fn clear_playback_item(&self, item: &ItemAttributes) -> bool {
        let mut items = self.inner.items.lock();
        let clear = items.cleared.local_id != item.local_id && items.enqueued.local_id == item.local_id;
        if clear {
            self.clear_locked(&mut items);
        }
        clear
    }

    /// Clear whatever is enqueued; its later chunks are rejected
    pub fn clear_playback(&self) {
        let mut items = self.inner.items.lock();
        self.clear_locked(&mut items);
    }

    /// Queue `audio` of `item` for playback
    ///
    /// A newer item replaces the enqueued one. Returns whether the audio was accepted.
    pub fn enqueue_for_playback(&self, item: &ItemAttributes, audio: &[u8]) -> bool {
        let mut items = self.inner.items.lock();
        self.promote_locked(&mut items, item);

        if items.enqueued.local_id != item.local_id || items.cleared.local_id == item.local_id {
            trace!("Dropped {} bytes of stale item {:?}", audio.len(), item.local_id);
            return false;
        }
        if audio.is_empty() {
            return true;
        }
        let written = self.speaker().write(audio);
        if written < audio.len() {
            debug!(
                "Speaker buffer full, {} bytes of item {:?} dropped",
                audio.len() - written,
                item.local_id
            );
        }
        written > 0
    }

    /// Streaming delta of `item`: enqueue audio, and let transcript-only deltas
    /// still mark the item as current
    pub fn handle_streaming_delta(&self, item: &ItemAttributes, audio: Option<&[u8]>, transcript: Option<&str>) {
        if let Some(audio) = audio {
            self.enqueue_for_playback(item, audio);
        }
        if transcript.is_some_and(|text| !text.is_empty()) {
            let mut items = self.inner.items.lock();
            self.promote_locked(&mut items, item);
        }
    }

    pub fn task_list(&self) -> Vec<WorkerTask> {
        vec![self.inner.output.worker().clone()]
    }

    fn promote_locked(&self, items: &mut PlaybackItems, item: &ItemAttributes) {
        if items.enqueued.local_id < item.local_id {
            self.clear_locked(items);
            items.enqueued = item.clone();
            self.inner.output.notify_item_enqueued(item);
            trace!("Item {:?} enqueued for playback", item.local_id);
        }
    }

    fn clear_locked(&self, items: &mut PlaybackItems) {
        items.cleared = items.enqueued.clone();
        self.speaker().clear_buffer();
        self.inner.output.reset_position_marker();
        debug!("Playback cleared for item {:?}", items.cleared.local_id);
    }
}
