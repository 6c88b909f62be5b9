//! Image-directory replay source for offline runs.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use image::imageops::{self, FilterType};
use tracing::debug;

use crate::types::{CaptureError, Frame, FrameFormat, FrameSource};

const EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Cycles through the images of a directory in file-name order.
pub struct ReplaySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    next: usize,
    target_size: (u32, u32),
    interval: Option<Duration>,
}

impl ReplaySource {
    /// An empty or unreadable directory counts as a failed open.
    pub fn open(dir: impl AsRef<Path>, target_size: (u32, u32)) -> Result<Self, CaptureError> {
        let dir = dir.as_ref().to_path_buf();
        let open_err = || CaptureError::Open {
            uri: dir.display().to_string(),
        };
        let entries = fs::read_dir(&dir).map_err(|_| open_err())?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        if files.is_empty() {
            return Err(open_err());
        }
        files.sort();
        debug!(dir = %dir.display(), count = files.len(), "replay source opened");
        Ok(Self {
            dir,
            files,
            next: 0,
            target_size,
            interval: None,
        })
    }

    /// Sleep between frames to emulate a camera frame rate.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ReplaySource {
    fn describe(&self) -> String {
        format!("replay {}", self.dir.display())
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(interval) = self.interval {
            thread::sleep(interval);
        }
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();

        let data = load_bgr(path, self.target_size)?;
        Ok(Frame {
            data,
            width: self.target_size.0,
            height: self.target_size.1,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        })
    }
}

/// Decode an image file and return it as packed BGR of exactly `size`.
pub fn load_bgr(path: &Path, (width, height): (u32, u32)) -> Result<Vec<u8>, CaptureError> {
    let decoded = image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8();
    let rgb = if decoded.dimensions() == (width, height) {
        decoded
    } else {
        imageops::resize(&decoded, width, height, FilterType::Triangle)
    };
    let mut data = rgb.into_raw();
    for px in data.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    Ok(data)
}
