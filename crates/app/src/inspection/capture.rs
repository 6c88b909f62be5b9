//! Frame capture worker: frame source into the channel's raw buffer.

use std::{sync::Arc, thread, time::Duration};

use anyhow::Result;
use tracing::{debug, info, warn};
use video_ingest::{CaptureError, FrameSource, ReplaySource, rotate_180_bgr};

use crate::inspection::{
    channel::Channel,
    config::SourceConfig,
    frame_buffer::ChannelFrames,
    status::{FaultOnPanic, StatusStore},
    telemetry,
};

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub channel: Channel,
    /// Rotate every frame by 180 degrees before it is stored.
    pub flip: bool,
    /// Pause after a failed read.
    pub read_backoff: Duration,
}

impl CaptureSettings {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            flip: false,
            read_backoff: channel.default_read_backoff(),
        }
    }
}

/// Open the configured source at the buffer resolution.
pub fn open_source(
    source: &SourceConfig,
    size: (u32, u32),
) -> Result<Box<dyn FrameSource>, CaptureError> {
    match source {
        SourceConfig::Replay { dir, interval_ms } => {
            let mut replay = ReplaySource::open(dir, size)?;
            if let Some(ms) = interval_ms {
                replay = replay.with_interval(Duration::from_millis(*ms));
            }
            Ok(Box::new(replay))
        }
        #[cfg(feature = "with-opencv")]
        SourceConfig::Camera { uri, fps } => Ok(Box::new(video_ingest::OpenCvCamera::open(
            uri, size, *fps,
        )?)),
        #[cfg(not(feature = "with-opencv"))]
        SourceConfig::Camera { uri, .. } => Err(CaptureError::Other(anyhow::anyhow!(
            "camera {uri} needs the `with-opencv` feature"
        ))),
    }
}

/// Outcome of one capture attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum CaptureStep {
    Stored(u64),
    Retry,
}

/// Read one frame and store it. Read failures are transient; anything that
/// cannot be retried is returned as an error.
pub fn capture_once(
    source: &mut dyn FrameSource,
    frames: &ChannelFrames,
    settings: &CaptureSettings,
) -> Result<CaptureStep> {
    match source.read_frame() {
        Ok(mut frame) => {
            if settings.flip {
                rotate_180_bgr(&mut frame.data);
            }
            let sequence = frames.raw.write(&frame.data)?;
            Ok(CaptureStep::Stored(sequence))
        }
        Err(err) if err.is_fatal() => Err(err.into()),
        Err(err) => {
            warn!(channel = %settings.channel, error = %err, "frame read failed");
            metrics::counter!("inspect_capture_failures_total", "channel" => settings.channel.label())
                .increment(1);
            Ok(CaptureStep::Retry)
        }
    }
}

pub fn run_capture(
    source: &mut dyn FrameSource,
    frames: &ChannelFrames,
    store: &StatusStore,
    settings: &CaptureSettings,
) -> Result<()> {
    let mut stored: u64 = 0;
    while !store.should_stop() {
        match capture_once(source, frames, settings)? {
            CaptureStep::Stored(sequence) => {
                stored = sequence;
                if sequence % 300 == 0 {
                    debug!(channel = %settings.channel, frames = sequence, "capture heartbeat");
                }
            }
            CaptureStep::Retry => thread::sleep(settings.read_backoff),
        }
    }
    info!(channel = %settings.channel, frames = stored, "capture stopped");
    Ok(())
}

/// Open the source on the worker thread and capture until stop or fault.
/// A source that fails to open is not retried.
pub fn spawn_capture_worker<F>(
    open: F,
    frames: Arc<ChannelFrames>,
    store: Arc<StatusStore>,
    settings: CaptureSettings,
) -> std::io::Result<thread::JoinHandle<()>>
where
    F: FnOnce() -> Result<Box<dyn FrameSource>, CaptureError> + Send + 'static,
{
    let name = format!("capture-{}", settings.channel.label().to_lowercase());
    telemetry::spawn_thread(name.clone(), move || {
        let _guard = FaultOnPanic::new(store.clone(), name.clone());
        let _span = tracing::info_span!("capture", channel = %settings.channel).entered();
        let mut source = match open() {
            Ok(source) => source,
            Err(err) => {
                store.raise_fault(&name, format!("failed to open frame source: {err}"));
                return;
            }
        };
        info!(source = %source.describe(), flip = settings.flip, "capture started");
        if let Err(err) = run_capture(source.as_mut(), &frames, &store, &settings) {
            store.raise_fault(&name, format!("{err:#}"));
        }
    })
}
