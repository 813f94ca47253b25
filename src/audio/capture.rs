//! Microphone capture stream
//!
//! The device callback writes raw PCM into the ring; the capture worker pulls
//! fixed-size chunks out. Reads are all-or-nothing so the network side only ever
//! sees complete frames.

use crate::audio::format::AudioFormat;
use crate::audio::ring::RingBufferStream;
use crate::runtime::cancel::CancelToken;
use std::io;

pub const MICROPHONE_BUFFER_SECONDS: u32 = 5;

#[derive(Clone, Debug)]
pub struct MicrophoneStream {
    ring: RingBufferStream,
    format: AudioFormat,
}

impl MicrophoneStream {
    pub fn new(format: AudioFormat, microphone: CancelToken) -> Self {
        Self::with_seconds(format, MICROPHONE_BUFFER_SECONDS, microphone)
    }

    pub fn with_seconds(format: AudioFormat, seconds: u32, microphone: CancelToken) -> Self {
        Self {
            ring: RingBufferStream::new(format.buffer_size_from_seconds(seconds), microphone),
            format,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Producer side, fed by the capture device
    pub fn write(&self, bytes: &[u8]) -> usize {
        self.ring.write(bytes)
    }

    /// Fill `buf` completely or return 0
    ///
    /// Blocks until `buf.len()` bytes are buffered, the microphone signal is
    /// canceled, or the stream is disposed.
    pub fn read_exact_chunk(&self, buf: &mut [u8]) -> usize {
        if !self.ring.wait_data_available(buf.len(), None) {
            return 0;
        }
        self.ring.read(buf)
    }

    /// Same as [`read_exact_chunk`](Self::read_exact_chunk), also giving up when `worker` is canceled
    pub fn read_exact_chunk_or(&self, buf: &mut [u8], worker: &CancelToken) -> usize {
        if !self.ring.wait_data_available_or(buf.len(), None, worker) {
            return 0;
        }
        self.ring.read(buf)
    }

    pub fn is_cancelled(&self) -> bool {
        self.ring.is_cancelled()
    }

    /// The stream was closed, as when the capture device goes away
    pub fn is_closed(&self) -> bool {
        self.ring.is_disposed()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.ring.buffered_bytes()
    }

    pub fn overflow_bytes(&self) -> u64 {
        self.ring.overflow_bytes()
    }

    /// Stop accepting audio and wake any blocked reader
    pub fn close(&self) {
        self.ring.dispose();
    }
}

impl io::Read for MicrophoneStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_exact_chunk(buf))
    }
}
