//! Frame sources feeding the capture workers.
//!
//! Cameras are opened through OpenCV when the `with-opencv` feature is on.
//! [`replay::ReplaySource`] is always available and is what offline runs use.

#[cfg(feature = "with-opencv")]
pub mod camera;
pub mod orientation;
pub mod replay;
pub mod types;

#[cfg(feature = "with-opencv")]
pub use camera::OpenCvCamera;
pub use orientation::rotate_180_bgr;
pub use replay::{ReplaySource, load_bgr};
pub use types::{CaptureError, Frame, FrameFormat, FrameSource};

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_index() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }
}
