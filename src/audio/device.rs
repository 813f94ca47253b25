//! cpal-backed capture and playback devices
//!
//! The capture callback converts float samples to 16-bit PCM and writes them
//! into a [`MicrophoneStream`]; the playback callback pulls from a
//! [`SpeakerStream`], which never stalls the device.

use crate::audio::capture::MicrophoneStream;
use crate::audio::format::{pcm16_from_f32, AudioFormat};
use crate::audio::playback::SpeakerStream;
use crate::error::{Result, VoxError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tracing::{error, info};

fn stream_config(format: AudioFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Default input device feeding a [`MicrophoneStream`]
pub struct MicrophoneDevice {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl MicrophoneDevice {
    pub fn new(format: AudioFormat) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| VoxError::AudioDevice("No input device available".into()))?;

        info!(
            "Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        Ok(Self {
            device,
            config: stream_config(format),
            stream: None,
        })
    }

    /// Start capturing into `microphone`
    pub fn start(&mut self, microphone: MicrophoneStream) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let err_fn = |err| {
            error!("Audio input stream error: {}", err);
        };

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if microphone.is_cancelled() {
                        return;
                    }
                    microphone.write(&pcm16_from_f32(data));
                },
                err_fn,
                None,
            )
            .map_err(|e| VoxError::AudioDevice(format!("Failed to build input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| VoxError::AudioDevice(format!("Failed to start input stream: {}", e)))?;

        self.stream = Some(stream);
        info!("Started audio capture");
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("Stopped audio capture");
        }
    }
}

impl Drop for MicrophoneDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default output device pulling from a [`SpeakerStream`]
pub struct SpeakerDevice {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl SpeakerDevice {
    pub fn new(format: AudioFormat) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| VoxError::AudioDevice("No output device available".into()))?;

        info!(
            "Using output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        Ok(Self {
            device,
            config: stream_config(format),
            stream: None,
        })
    }

    pub fn start(&mut self, speaker: SpeakerStream) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let err_fn = |err| {
            error!("Audio output stream error: {}", err);
        };

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    speaker.fill_samples(data);
                },
                err_fn,
                None,
            )
            .map_err(|e| VoxError::AudioDevice(format!("Failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| VoxError::AudioDevice(format!("Failed to start output stream: {}", e)))?;

        self.stream = Some(stream);
        info!("Started audio playback");
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("Stopped audio playback");
        }
    }
}

impl Drop for SpeakerDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
