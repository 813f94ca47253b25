//! Intermediate buffer between audio capture and the network send loop

use crate::audio::format::AudioFormat;
use crate::audio::ring::RingBufferStream;
use crate::runtime::cancel::CancelToken;
use std::io;

pub const STAGING_MIN_READ_MS: u64 = 100;

/// Partial-read buffer: a read returns once `min(len, 100 ms of audio)` is buffered
#[derive(Clone, Debug)]
pub struct AudioStagingBuffer {
    ring: RingBufferStream,
    min_read_bytes: usize,
}

impl AudioStagingBuffer {
    pub fn new(format: AudioFormat, seconds: u32, cancel: CancelToken) -> Self {
        Self::with_min_read(format, seconds, STAGING_MIN_READ_MS, cancel)
    }

    pub fn with_min_read(format: AudioFormat, seconds: u32, min_read_ms: u64, cancel: CancelToken) -> Self {
        Self {
            ring: RingBufferStream::new(format.buffer_size_from_seconds(seconds), cancel),
            min_read_bytes: format.buffer_size_from_millis(min_read_ms),
        }
    }

    pub fn write(&self, bytes: &[u8]) -> usize {
        self.ring.write(bytes)
    }

    /// Read whatever is buffered once the minimum threshold is reached
    ///
    /// Returns 0 when the wait is canceled or the buffer disposed.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.read_inner(buf, None)
    }

    /// Same as [`read`](Self::read), also giving up when `worker` is canceled
    pub fn read_or(&self, buf: &mut [u8], worker: &CancelToken) -> usize {
        self.read_inner(buf, Some(worker))
    }

    fn read_inner(&self, buf: &mut [u8], worker: Option<&CancelToken>) -> usize {
        let min_asked = self.min_read_bytes.min(buf.len());
        if self.ring.buffered_bytes() < min_asked {
            let ready = match worker {
                Some(worker) => self.ring.wait_data_available_or(min_asked, None, worker),
                None => self.ring.wait_data_available(min_asked, None),
            };
            if !ready {
                return 0;
            }
        }
        self.ring.read(buf)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.ring.buffered_bytes()
    }

    pub fn min_read_bytes(&self) -> usize {
        self.min_read_bytes
    }

    pub fn dispose(&self) {
        self.ring.dispose();
    }
}

impl io::Read for AudioStagingBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(AudioStagingBuffer::read(self, buf))
    }
}
