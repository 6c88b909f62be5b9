use anyhow::Error;
use thiserror::Error;

/// Raw BGR frame captured from a video source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source {uri:?} returned an empty frame")]
    EmptyFrame { uri: String },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    /// Open failures end the capture worker; everything else is retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// A blocking source of frames, read from by exactly one capture worker.
pub trait FrameSource: Send {
    fn describe(&self) -> String;
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).read_frame()
    }
}
