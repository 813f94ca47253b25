//! PCM format descriptor used to size audio buffers

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interleaved little-endian PCM format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
}

impl Default for AudioFormat {
    /// 24 kHz mono 16-bit, the conversation service's wire format
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            bytes_per_sample: 2,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16, bytes_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_sample,
        }
    }

    /// Bytes in one frame (one sample for every channel)
    pub fn block_align(&self) -> usize {
        self.bytes_per_sample as usize * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.block_align() * self.sample_rate as usize
    }

    pub fn buffer_size_from_seconds(&self, seconds: u32) -> usize {
        self.bytes_per_second() * seconds as usize
    }

    /// Uses whole samples per millisecond, so rates below 1 kHz round down to zero
    pub fn buffer_size_from_millis(&self, millis: u64) -> usize {
        let samples_per_milli = (self.sample_rate / 1000) as usize;
        self.block_align() * samples_per_milli * millis as usize
    }

    pub fn buffer_size_from_duration(&self, duration: Duration) -> usize {
        self.buffer_size_from_millis(duration.as_millis() as u64)
    }

    /// Playback time represented by `bytes`
    pub fn millis_from_bytes(&self, bytes: u64) -> u64 {
        let per_second = self.bytes_per_second() as u64;
        if per_second == 0 {
            return 0;
        }
        bytes * 1000 / per_second
    }
}

/// Convert float samples in `[-1, 1]` to 16-bit little-endian PCM
pub fn pcm16_from_f32(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}
