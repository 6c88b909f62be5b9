use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameBufferError {
    #[error("frame of {got} bytes does not fit a {expected}-byte buffer")]
    SizeMismatch { expected: usize, got: usize },
}

/// Fixed-shape BGR frame shared between one writer and any number of readers.
///
/// The lock is held only while copying. The sequence number increases on
/// every successful write, so readers can tell a fresh frame from one they
/// already handled; zero means nothing was ever written.
pub struct FrameBuffer {
    width: u32,
    height: u32,
    pixels: Mutex<Vec<u8>>,
    sequence: AtomicU64,
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: Mutex::new(vec![0; width as usize * height as usize * 3]),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn write(&self, data: &[u8]) -> Result<u64, FrameBufferError> {
        if data.len() != self.byte_len() {
            return Err(FrameBufferError::SizeMismatch {
                expected: self.byte_len(),
                got: data.len(),
            });
        }
        let mut pixels = self.pixels.lock().unwrap_or_else(PoisonError::into_inner);
        pixels.copy_from_slice(data);
        Ok(self.sequence.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Copy the current frame into `out`, returning its sequence number.
    pub fn snapshot_into(&self, out: &mut Vec<u8>) -> u64 {
        let pixels = self.pixels.lock().unwrap_or_else(PoisonError::into_inner);
        out.clear();
        out.extend_from_slice(&pixels);
        self.sequence.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> (Vec<u8>, u64) {
        let mut out = Vec::with_capacity(self.byte_len());
        let sequence = self.snapshot_into(&mut out);
        (out, sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }
}

/// Raw and annotated buffers of one channel.
pub struct ChannelFrames {
    pub raw: FrameBuffer,
    pub annotated: FrameBuffer,
}

impl ChannelFrames {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            raw: FrameBuffer::new(width, height),
            annotated: FrameBuffer::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.raw.width()
    }

    pub fn height(&self) -> u32 {
        self.raw.height()
    }
}
