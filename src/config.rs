//! Session configuration
//!
//! Everything the session core is parameterized by. Nothing here is read from
//! the environment; callers build a `SessionConfig` in code or load one from TOML.

use crate::audio::format::AudioFormat;
use crate::error::{Result, VoxError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one conversation session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// PCM format shared by capture, network and playback
    pub audio_format: AudioFormat,

    /// Staging buffer between capture and send
    pub input_buffer_seconds: u32,

    pub microphone_buffer_seconds: u32,

    pub speaker_buffer_seconds: u32,

    /// Audio that must be written before playback starts yielding
    pub playback_warmup_ms: u64,

    /// Minimum audio a staging read waits for
    pub staging_min_read_ms: u64,

    /// Chunk size moved from the microphone per read
    pub capture_chunk_bytes: usize,

    /// Delay after speech starts before the playing item is cleared
    pub clear_enqueued_timeout_ms: u64,

    /// Playback volume while the user is speaking
    pub volume_ratio_during_speech: f32,

    pub output_poll_ms: u64,

    pub shutdown_timeout_ms: u64,

    /// Thread name of the event relay
    pub relay_label: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            audio_format: AudioFormat::default(),
            input_buffer_seconds: 2,
            microphone_buffer_seconds: 5,
            speaker_buffer_seconds: 300,
            playback_warmup_ms: 250,
            staging_min_read_ms: 100,
            capture_chunk_bytes: 4096,
            clear_enqueued_timeout_ms: 2000,
            volume_ratio_during_speech: 0.3,
            output_poll_ms: 250,
            shutdown_timeout_ms: 10_000,
            relay_label: "session-relay".to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| VoxError::Config(format!("Invalid session config: {}", e)))
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VoxError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VoxError::Config(e.to_string()))
    }

    pub fn with_audio_format(mut self, format: AudioFormat) -> Self {
        self.audio_format = format;
        self
    }

    pub fn with_clear_enqueued_timeout(mut self, timeout: Duration) -> Self {
        self.clear_enqueued_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_output_poll(mut self, interval: Duration) -> Self {
        self.output_poll_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_relay_label(mut self, label: impl Into<String>) -> Self {
        self.relay_label = label.into();
        self
    }

    pub fn output_poll_interval(&self) -> Duration {
        Duration::from_millis(self.output_poll_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let format = &self.audio_format;
        if format.sample_rate < 1000 || format.channels == 0 || format.bytes_per_sample == 0 {
            return Err(VoxError::Config(format!(
                "Unsupported audio format: {} Hz, {} channels, {} bytes/sample",
                format.sample_rate, format.channels, format.bytes_per_sample
            )));
        }

        for (name, seconds) in [
            ("input_buffer_seconds", self.input_buffer_seconds),
            ("microphone_buffer_seconds", self.microphone_buffer_seconds),
            ("speaker_buffer_seconds", self.speaker_buffer_seconds),
        ] {
            if seconds == 0 {
                return Err(VoxError::Config(format!("{} must be positive", name)));
            }
        }

        let microphone_bytes = format.buffer_size_from_seconds(self.microphone_buffer_seconds);
        if self.capture_chunk_bytes == 0 || self.capture_chunk_bytes > microphone_bytes {
            return Err(VoxError::Config(format!(
                "capture_chunk_bytes must be between 1 and {}",
                microphone_bytes
            )));
        }

        if !(0.0..=1.0).contains(&self.volume_ratio_during_speech) {
            return Err(VoxError::Config(
                "volume_ratio_during_speech must be within 0.0..=1.0".to_string(),
            ));
        }

        if self.output_poll_ms == 0 {
            return Err(VoxError::Config("output_poll_ms must be positive".to_string()));
        }

        if self.relay_label.is_empty() {
            return Err(VoxError::Config("relay_label must not be empty".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio_format.sample_rate, 24_000);
        assert_eq!(config.capture_chunk_bytes, 4096);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
            clear_enqueued_timeout_ms = 1500
            volume_ratio_during_speech = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.clear_enqueued_timeout_ms, 1500);
        assert_eq!(config.volume_ratio_during_speech, 0.5);
        assert_eq!(config.speaker_buffer_seconds, 300);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SessionConfig::default().with_relay_label("relay");
        let text = config.to_toml_string().unwrap();
        assert_eq!(SessionConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_volume_rejected() {
        let mut config = SessionConfig::default();
        config.volume_ratio_during_speech = 1.5;
        assert!(matches!(config.validate(), Err(VoxError::Config(_))));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut config = SessionConfig::default();
        config.capture_chunk_bytes = 1 << 30;
        assert!(config.validate().is_err());
    }
}
