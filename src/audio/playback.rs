//! Speaker playback stream
//!
//! Network audio deltas are written in; the output device pulls from it. The
//! device side never stalls: shortfalls are padded with silence, and nothing is
//! handed out until a warm-up amount has been written since the last clear.

use crate::audio::format::AudioFormat;
use crate::audio::ring::RingBufferStream;
use crate::runtime::cancel::CancelToken;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const SPEAKER_BUFFER_SECONDS: u32 = 60 * 5;
pub const PLAYBACK_WARMUP_MS: u64 = 250;

/// Added to a non-empty buffered duration to cover what the device has queued
const DEVICE_LATENCY_MS: u64 = 500;

#[derive(Clone, Debug)]
pub struct SpeakerStream {
    ring: RingBufferStream,
    format: AudioFormat,
    warmup_bytes: u64,
    /// f32 bits
    volume: Arc<AtomicU32>,
}

impl SpeakerStream {
    pub fn new(format: AudioFormat, speaker: CancelToken) -> Self {
        Self::with_limits(format, SPEAKER_BUFFER_SECONDS, PLAYBACK_WARMUP_MS, speaker)
    }

    pub fn with_limits(format: AudioFormat, seconds: u32, warmup_ms: u64, speaker: CancelToken) -> Self {
        Self {
            ring: RingBufferStream::new(format.buffer_size_from_seconds(seconds), speaker),
            format,
            warmup_bytes: format.buffer_size_from_millis(warmup_ms) as u64,
            volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn write(&self, bytes: &[u8]) -> usize {
        self.ring.write(bytes)
    }

    /// Pop buffered audio, or nothing while still warming up
    pub fn read(&self, buf: &mut [u8]) -> usize {
        if self.ring.total_written() < self.warmup_bytes {
            return 0;
        }
        self.ring.read(buf)
    }

    /// Always fills `buf`, zero-filling whatever audio is missing
    pub fn read_padded(&self, buf: &mut [u8]) -> usize {
        let read = self.read(buf);
        buf[read..].fill(0);
        buf.len()
    }

    /// Fill `out` with volume-scaled samples, for 16-bit little-endian formats
    pub fn fill_samples(&self, out: &mut [f32]) {
        let mut bytes = vec![0u8; out.len() * 2];
        self.read_padded(&mut bytes);
        let volume = self.volume();
        for (sample, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
            let value = i16::from_le_bytes([pair[0], pair[1]]);
            *sample = value as f32 / i16::MAX as f32 * volume;
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Buffered playback time; non-zero values include the device latency allowance
    pub fn buffered_ms(&self) -> u64 {
        let millis = self.format.millis_from_bytes(self.ring.buffered_bytes() as u64);
        if millis > 0 {
            millis + DEVICE_LATENCY_MS
        } else {
            0
        }
    }

    /// Milliseconds of audio handed to the device so far
    pub fn position_ms(&self) -> u64 {
        self.format.millis_from_bytes(self.ring.total_read())
    }

    /// Drop queued audio; warm-up applies again to the next writes
    pub fn clear_buffer(&self) {
        self.ring.clear_buffer();
    }

    pub fn is_cancelled(&self) -> bool {
        self.ring.is_cancelled()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.ring.buffered_bytes()
    }

    pub fn dispose(&self) {
        self.ring.dispose();
    }
}

impl io::Read for SpeakerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_padded(buf))
    }
}

impl io::Write for SpeakerStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(SpeakerStream::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cancel::CancelSource;

    fn speaker() -> (SpeakerStream, CancelSource) {
        let source = CancelSource::new("speaker");
        (SpeakerStream::new(AudioFormat::default(), source.token()), source)
    }

    #[test]
    fn test_silent_until_warmed_up() {
        let (speaker, _source) = speaker();
        // 250 ms at 24 kHz mono 16-bit
        speaker.write(&vec![5u8; 11_998]);

        let mut buf = [9u8; 64];
        assert_eq!(speaker.read(&mut buf), 0);
        assert_eq!(speaker.read_padded(&mut buf), 64);
        assert!(buf.iter().all(|b| *b == 0));

        speaker.write(&[5u8; 2]);
        assert_eq!(speaker.read(&mut buf), 64);
        assert!(buf.iter().all(|b| *b == 5));
    }

    #[test]
    fn test_padding_fills_shortfall() {
        let (speaker, _source) = speaker();
        speaker.write(&vec![3u8; 12_000]);
        let mut drain = vec![0u8; 11_990];
        speaker.read(&mut drain);

        let mut buf = [7u8; 32];
        assert_eq!(speaker.read_padded(&mut buf), 32);
        assert!(buf[..10].iter().all(|b| *b == 3));
        assert!(buf[10..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_clear_restarts_warmup() {
        let (speaker, _source) = speaker();
        speaker.write(&vec![1u8; 12_000]);
        speaker.clear_buffer();
        speaker.write(&[1u8; 100]);
        let mut buf = [0u8; 10];
        assert_eq!(speaker.read(&mut buf), 0);
    }

    #[test]
    fn test_buffered_ms_adds_latency() {
        let (speaker, _source) = speaker();
        assert_eq!(speaker.buffered_ms(), 0);
        speaker.write(&vec![0u8; 48_000]);
        assert_eq!(speaker.buffered_ms(), 1500);
    }

    #[test]
    fn test_position_tracks_consumed_audio() {
        let (speaker, _source) = speaker();
        speaker.write(&vec![0u8; 96_000]);
        let mut buf = vec![0u8; 48_000];
        speaker.read(&mut buf);
        assert_eq!(speaker.position_ms(), 1000);
    }

    #[test]
    fn test_volume_scales_samples() {
        let (speaker, _source) = speaker();
        let sample = i16::MAX.to_le_bytes();
        let mut audio = Vec::new();
        for _ in 0..6000 {
            audio.extend_from_slice(&sample);
        }
        speaker.write(&audio);
        speaker.set_volume(0.3);

        let mut out = [0f32; 4];
        speaker.fill_samples(&mut out);
        assert!(out.iter().all(|s| (*s - 0.3).abs() < 1e-4));
        assert!((speaker.volume() - 0.3).abs() < f32::EPSILON);
    }
}
