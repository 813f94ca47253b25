//! Playback monitor worker
//!
//! Watches the speaker stream and publishes [`PlaybackFinished`] when buffered
//! audio drains and [`PlaybackPositionReached`] when an armed position marker is
//! passed while its item is still the one being played.

use crate::audio::playback::SpeakerStream;
use crate::error::Result;
use crate::runtime::events::EventRegistry;
use crate::runtime::worker::WorkerTask;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Identity of a streamed conversation item
///
/// `item_id` comes from the service; `local_id` increases by one for every
/// item received in this session. `None` means no item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemAttributes {
    pub item_id: String,
    pub local_id: Option<u64>,
}

impl ItemAttributes {
    pub fn new(item_id: impl Into<String>, local_id: u64) -> Self {
        Self {
            item_id: item_id.into(),
            local_id: Some(local_id),
        }
    }

    pub fn is_set(&self) -> bool {
        self.local_id.is_some()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackFinished {
    pub item: ItemAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackPositionReached {
    pub item: ItemAttributes,
}

#[derive(Default)]
struct PlaybackMarks {
    enqueued: ItemAttributes,
    marked: ItemAttributes,
    marked_position_ms: Option<u64>,
}

struct OutputShared {
    speaker: SpeakerStream,
    marks: Mutex<PlaybackMarks>,
    events: Arc<EventRegistry>,
}

impl OutputShared {
    /// One monitoring pass; `previous_buffered` carries state between passes
    fn poll(&self, previous_buffered: &mut u64) {
        let buffered = self.speaker.buffered_ms();
        if buffered != *previous_buffered {
            if buffered == 0 {
                let item = self.marks.lock().enqueued.clone();
                trace!("Playback drained for item {:?}", item.local_id);
                self.publish(PlaybackFinished { item });
            }
            *previous_buffered = buffered;
        }

        let reached = {
            let mut marks = self.marks.lock();
            match marks.marked_position_ms {
                Some(mark)
                    if marks.marked.is_set()
                        && self.speaker.position_ms() > mark
                        && marks.enqueued.local_id == marks.marked.local_id =>
                {
                    let item = std::mem::take(&mut marks.marked);
                    marks.marked_position_ms = None;
                    Some(item)
                }
                _ => None,
            }
        };
        if let Some(item) = reached {
            debug!("Playback position reached for item {:?}", item.local_id);
            self.publish(PlaybackPositionReached { item });
        }
    }

    fn publish<M: crate::runtime::events::Message>(&self, message: M) {
        if let Err(e) = self.events.publish(message) {
            trace!("Playback notification dropped: {}", e);
        }
    }
}

/// Worker that monitors a [`SpeakerStream`]
#[derive(Clone)]
pub struct SessionAudioOutput {
    shared: Arc<OutputShared>,
    worker: WorkerTask,
}

impl SessionAudioOutput {
    pub fn new(speaker: SpeakerStream, poll_interval: Duration) -> Result<Self> {
        let events = Arc::new(EventRegistry::new());
        events.enable::<PlaybackFinished>()?;
        events.enable::<PlaybackPositionReached>()?;

        let shared = Arc::new(OutputShared {
            speaker,
            marks: Mutex::new(PlaybackMarks::default()),
            events,
        });

        let monitor = Arc::clone(&shared);
        let worker = WorkerTask::new("session-audio-output", move |token| {
            let mut previous_buffered = 0;
            while !token.is_cancelled() && !monitor.speaker.is_cancelled() {
                monitor.poll(&mut previous_buffered);
                if token.wait_timeout(poll_interval) {
                    break;
                }
            }
            Ok(())
        });

        Ok(Self { shared, worker })
    }

    pub fn start(&self) -> Result<()> {
        self.worker.start()
    }

    pub fn worker(&self) -> &WorkerTask {
        &self.worker
    }

    /// Registry with [`PlaybackFinished`] and [`PlaybackPositionReached`] enabled
    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.shared.events
    }

    pub fn speaker(&self) -> &SpeakerStream {
        &self.shared.speaker
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.speaker.set_volume(volume);
    }

    pub fn notify_item_enqueued(&self, item: &ItemAttributes) {
        self.shared.marks.lock().enqueued = item.clone();
    }

    /// Arm a marker `delay_ms` past the current playback position
    pub fn set_position_marker(&self, delay_ms: u64, item: &ItemAttributes) {
        let position = self.shared.speaker.position_ms() + delay_ms;
        let mut marks = self.shared.marks.lock();
        marks.marked = item.clone();
        marks.marked_position_ms = Some(position);
    }

    pub fn reset_position_marker(&self) {
        let mut marks = self.shared.marks.lock();
        marks.marked.clear();
        marks.marked_position_ms = None;
    }

    pub fn is_marker_armed(&self) -> bool {
        self.shared.marks.lock().marked_position_ms.is_some()
    }
}
