//! Audio buffering between devices, network and playback
//!
//! Capture path: device -> [`MicrophoneStream`] -> [`AudioStagingBuffer`] -> network.
//! Playback path: network -> [`SpeakerStream`] -> device, observed by
//! [`SessionAudioOutput`].

pub mod capture;
#[cfg(feature = "audio-io")]
pub mod device;
pub mod format;
pub mod output_task;
pub mod playback;
pub mod ring;
pub mod staging;

pub use capture::MicrophoneStream;
pub use format::AudioFormat;
pub use output_task::{ItemAttributes, PlaybackFinished, PlaybackPositionReached, SessionAudioOutput};
pub use playback::SpeakerStream;
pub use ring::RingBufferStream;
pub use staging::AudioStagingBuffer;
