//! Per-channel inference worker.
//!
//! Each cycle the worker looks at one sensor snapshot and, in this order,
//! admits a roller on the presence edge, runs the head pass on the head
//! trigger edge (BF only), runs detection on a fresh frame while rollers are
//! pending, and finalizes the oldest roller on the finalize edge. The ledger
//! is owned by the worker; other threads only see counters and decisions.

use std::{
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Sender;
use ml_core::{
    ClassLabels, ClassThresholds, Detection, FrameView, ObjectDetector, filter_detections,
};
use tracing::{debug, info, info_span, warn};

use crate::inspection::{
    annotation::{Canvas, annotate_detections, annotate_head},
    channel::Channel,
    command::Decision,
    config::{BitRoles, ModelConfig},
    correlation::{Correlation, correlate, partition, sort_by_left_edge},
    evidence::{EvidenceKind, EvidenceSink},
    frame_buffer::ChannelFrames,
    head_shape::{HEAD_DETECTOR_CONFIDENCE, HeadLimits, HeadMeasurement, measure},
    roller::{RollerLedger, RollerRecord, tally},
    status::{FaultOnPanic, RisingEdge, SensorBit, SensorSnapshot, StatusStore},
    telemetry,
};

pub const WARM_UP_ROUNDS: usize = 30;
const HEAD_WARM_UP_CONFIDENCE: f32 = 0.5;
/// Longest idle wait before the worker re-checks its frame buffer.
const IDLE_WAIT: Duration = Duration::from_millis(15);

/// Head-shape classifier run on the head trigger edge.
pub struct HeadPass {
    pub detector: Box<dyn ObjectDetector>,
    pub limits: HeadLimits,
    pub trigger: SensorBit,
}

/// Everything a [`ChannelInspector`] needs, assembled by the caller.
pub struct InspectorParts {
    pub channel: Channel,
    pub detector: Box<dyn ObjectDetector>,
    pub head: Option<HeadPass>,
    pub labels: ClassLabels,
    pub thresholds: ClassThresholds,
    pub roles: BitRoles,
    pub evidence: EvidenceSink,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeadOutcome {
    /// One of the reference boxes was missing.
    Skipped,
    Measured {
        measurement: HeadMeasurement,
        /// Roller the head defect was attributed to.
        attributed: Option<u64>,
    },
}

/// What one [`ChannelInspector::step`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub admitted: Option<u64>,
    pub head: Option<HeadOutcome>,
    /// Set when the detector ran this cycle.
    pub detection: Option<DetectionSummary>,
    pub finalized: Option<RollerRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSummary {
    pub kept: Vec<Detection>,
    pub correlation: Correlation,
    pub evidence_saved: usize,
}

pub struct ChannelInspector {
    channel: Channel,
    detector: Box<dyn ObjectDetector>,
    head: Option<HeadPass>,
    labels: ClassLabels,
    thresholds: ClassThresholds,
    roles: BitRoles,
    evidence: EvidenceSink,
    ledger: RollerLedger,
    presence_edge: RisingEdge,
    head_edge: RisingEdge,
    finalize_latched: bool,
    last_sequence: u64,
    frame: Vec<u8>,
    canvas: Vec<u8>,
}

impl ChannelInspector {
    pub fn new(parts: InspectorParts) -> Self {
        Self {
            channel: parts.channel,
            detector: parts.detector,
            head: parts.head,
            labels: parts.labels,
            thresholds: parts.thresholds,
            roles: parts.roles,
            evidence: parts.evidence,
            ledger: RollerLedger::new(),
            presence_edge: RisingEdge::default(),
            head_edge: RisingEdge::default(),
            finalize_latched: false,
            last_sequence: 0,
            frame: Vec::new(),
            canvas: Vec::new(),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn ledger(&self) -> &RollerLedger {
        &self.ledger
    }

    /// Run the detectors on `image` (a blank frame when `None`) so the first
    /// real cycle does not pay for lazy initialisation.
    pub fn warm_up(&mut self, image: Option<&[u8]>, width: u32, height: u32) -> Result<()> {
        let blank;
        let data = match image {
            Some(data) => data,
            None => {
                blank = vec![0u8; width as usize * height as usize * 3];
                &blank
            }
        };
        let view = FrameView::new(data, width, height)?;
        let confidence = self.thresholds.model_confidence();
        for _ in 0..WARM_UP_ROUNDS {
            self.detector
                .detect(view, confidence)
                .context("warm-up inference failed")?;
            if let Some(head) = self.head.as_mut() {
                head.detector
                    .detect(view, HEAD_WARM_UP_CONFIDENCE)
                    .context("head warm-up inference failed")?;
            }
        }
        Ok(())
    }

    pub fn step(
        &mut self,
        sensors: &SensorSnapshot,
        frames: &ChannelFrames,
        store: &StatusStore,
        decisions: &Sender<Decision>,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        if self.presence_edge.update(sensors.get(self.roles.presence)) {
            let id = self.ledger.admit();
            debug!(channel = %self.channel, roller = id, pending = self.ledger.pending(), "roller admitted");
            report.admitted = Some(id);
        }

        let head_trigger = self.head.as_ref().map(|head| sensors.get(head.trigger));
        if let Some(level) = head_trigger {
            if self.head_edge.update(level) {
                report.head = Some(self.head_pass(frames, store)?);
            }
        }

        if !self.ledger.is_empty() {
            let sequence = frames.raw.sequence();
            if sequence != 0 && sequence != self.last_sequence {
                report.detection = Some(self.detect(frames, store)?);
            }
        }

        if sensors.get(self.roles.finalize) {
            if !self.finalize_latched {
                if let Some(record) = self.ledger.pop_oldest() {
                    self.finalize_latched = true;
                    self.finalize(&record, store, decisions)?;
                    report.finalized = Some(record);
                }
            }
        } else {
            self.finalize_latched = false;
        }

        Ok(report)
    }

    fn detect(&mut self, frames: &ChannelFrames, store: &StatusStore) -> Result<DetectionSummary> {
        let (width, height) = (frames.width(), frames.height());
        self.last_sequence = frames.raw.snapshot_into(&mut self.frame);

        let started = Instant::now();
        let raw = self
            .detector
            .detect(
                FrameView::new(&self.frame, width, height)?,
                self.thresholds.model_confidence(),
            )
            .context("detector call failed")?;
        metrics::histogram!("inspect_inference_latency_seconds", "channel" => self.channel.label())
            .record(started.elapsed().as_secs_f64());

        let outcome = filter_detections(self.labels.apply(&raw), &self.thresholds);
        let dropped = outcome.dropped_confidence + outcome.dropped_size;
        if dropped > 0 {
            metrics::counter!("inspect_detections_dropped_total", "channel" => self.channel.label())
                .increment(dropped as u64);
        }
        let mut kept = outcome.kept;
        sort_by_left_edge(&mut kept);
        let split = partition(&kept);
        let correlation = correlate(&mut self.ledger, &split, self.channel.correlation_window());
        for (roller, defect) in &correlation.attributed {
            debug!(channel = %self.channel, roller, defect = %defect, "defect attributed");
        }
        if correlation.stale > 0 {
            debug!(channel = %self.channel, stale = correlation.stale, "defects matched a finalized roller");
        }

        self.canvas.clear();
        self.canvas.extend_from_slice(&self.frame);
        annotate_detections(&mut Canvas::new(&mut self.canvas, width, height), &kept);
        frames.annotated.write(&self.canvas)?;

        let mut evidence_saved = 0;
        if split.has_rollers() {
            let mut kinds = Vec::with_capacity(2);
            if split.has_defects() {
                kinds.push(EvidenceKind::Defect(self.channel));
            }
            if store.archive_all() {
                kinds.push(EvidenceKind::Archive(self.channel));
            }
            for kind in kinds {
                if self.save_evidence(kind, width, height) {
                    evidence_saved += 1;
                }
            }
        }

        Ok(DetectionSummary {
            kept,
            correlation,
            evidence_saved,
        })
    }

    fn head_pass(&mut self, frames: &ChannelFrames, store: &StatusStore) -> Result<HeadOutcome> {
        let Some(head) = self.head.as_mut() else {
            return Ok(HeadOutcome::Skipped);
        };
        let (width, height) = (frames.width(), frames.height());
        frames.raw.snapshot_into(&mut self.frame);
        let raw = head
            .detector
            .detect(FrameView::new(&self.frame, width, height)?, HEAD_DETECTOR_CONFIDENCE)
            .context("head classifier call failed")?;
        let Some(measurement) = measure(&raw, &head.limits) else {
            warn!(channel = %self.channel, boxes = raw.len(), "head pass skipped, reference box missing");
            return Ok(HeadOutcome::Skipped);
        };

        let newest = self.ledger.newest_id();
        let mut attributed = None;
        if measurement.head.is_defect() {
            if self.ledger.attribute(newest, measurement.head.label()) {
                attributed = Some(newest);
            } else {
                warn!(channel = %self.channel, roller = newest, head = %measurement.head, "no pending roller for head defect");
            }
        }
        info!(
            channel = %self.channel,
            roller = newest,
            head = %measurement.head,
            offset = measurement.offset,
            "head measured"
        );

        // normal heads leave no image, even in archive mode
        if measurement.head.is_defect() {
            self.canvas.clear();
            self.canvas.extend_from_slice(&self.frame);
            annotate_head(&mut Canvas::new(&mut self.canvas, width, height), &measurement, newest);
            self.save_evidence(EvidenceKind::HeadDefect, width, height);
            if store.archive_all() {
                self.save_evidence(EvidenceKind::HeadArchive, width, height);
            }
        }

        Ok(HeadOutcome::Measured {
            measurement,
            attributed,
        })
    }

    fn save_evidence(&mut self, kind: EvidenceKind, width: u32, height: u32) -> bool {
        match self.evidence.save(kind, &self.canvas, width, height) {
            Ok(path) => {
                debug!(path = %path.display(), "evidence saved");
                true
            }
            Err(err) => {
                warn!(channel = %self.channel, ?kind, "failed to save evidence: {err:#}");
                false
            }
        }
    }

    fn finalize(
        &self,
        record: &RollerRecord,
        store: &StatusStore,
        decisions: &Sender<Decision>,
    ) -> Result<()> {
        let counts = tally(record, self.channel.known_defects());
        store.counters(self.channel).record(self.channel, &counts);
        metrics::counter!(
            "inspect_rollers_finalized_total",
            "channel" => self.channel.label(),
            "result" => if counts.accepted { "accepted" } else { "rejected" }
        )
        .increment(1);
        info!(
            channel = %self.channel,
            roller = record.id(),
            defect = record.defect(),
            names = ?record.defect_names(),
            pending = self.ledger.pending(),
            "roller finalized"
        );
        decisions
            .send(Decision {
                roller_id: record.id(),
                defect_detected: record.defect(),
            })
            .map_err(|_| anyhow!("decision queue closed"))
    }
}

/// Step the inspector until stop. When no detection ran the worker waits for
/// the next sensor publish instead of spinning.
pub fn run_inference(
    inspector: &mut ChannelInspector,
    frames: &ChannelFrames,
    store: &StatusStore,
    decisions: &Sender<Decision>,
) -> Result<()> {
    while !store.should_stop() {
        let seen = store.sensor_epoch();
        let sensors = store.sensors();
        let report = inspector.step(&sensors, frames, store, decisions)?;
        if report.detection.is_none() {
            store.wait_for_sensors(seen, IDLE_WAIT);
        }
    }
    info!(channel = %inspector.channel(), pending = inspector.ledger().pending(), "inference stopped");
    Ok(())
}

/// Load the detector described by `model`.
#[cfg(feature = "with-tch")]
pub fn load_detector(model: &ModelConfig) -> Result<Box<dyn ObjectDetector>> {
    use ml_core::{detector::TorchDetector, tch::Device};

    let device = if model.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let detector = TorchDetector::load(&model.path, device, model.input_size)
        .with_context(|| format!("failed to load model {}", model.path.display()))?;
    info!(model = %model.path.display(), ?device, "detector loaded");
    Ok(Box::new(detector))
}

#[cfg(not(feature = "with-tch"))]
pub fn load_detector(model: &ModelConfig) -> Result<Box<dyn ObjectDetector>> {
    Err(anyhow!(
        "cannot load {}: built without the `with-tch` feature",
        model.path.display()
    ))
}

pub fn labels_for(model: &ModelConfig) -> ClassLabels {
    ClassLabels::new(model.classes.clone(), model.roller_class)
}

/// Build the inspector on the worker thread, warm it up, flag the channel
/// ready and run until stop. Build failures are fatal; a warm-up failure
/// leaves the channel not ready.
pub fn spawn_inference_worker<F>(
    build: F,
    warm_up_image: Option<std::path::PathBuf>,
    frames: Arc<ChannelFrames>,
    store: Arc<StatusStore>,
    decisions: Sender<Decision>,
    channel: Channel,
) -> std::io::Result<thread::JoinHandle<()>>
where
    F: FnOnce() -> Result<ChannelInspector> + Send + 'static,
{
    let name = format!("inference-{}", channel.label().to_lowercase());
    telemetry::spawn_thread(name.clone(), move || {
        let _guard = FaultOnPanic::new(store.clone(), name.clone());
        let _span = info_span!("inference", %channel).entered();
        let mut inspector = match build() {
            Ok(inspector) => inspector,
            Err(err) => {
                store.raise_fault(&name, format!("startup failed: {err:#}"));
                return;
            }
        };

        match warm_up(&mut inspector, warm_up_image.as_deref(), &frames) {
            Ok(()) => {
                store.set_channel_ready(channel, true);
                info!(rounds = WARM_UP_ROUNDS, "warm-up complete, channel ready");
            }
            Err(err) => warn!("warm-up failed, channel stays not ready: {err:#}"),
        }

        if let Err(err) = run_inference(&mut inspector, &frames, &store, &decisions) {
            store.raise_fault(&name, format!("{err:#}"));
        }
    })
}

fn warm_up(inspector: &mut ChannelInspector, image: Option<&Path>, frames: &ChannelFrames) -> Result<()> {
    let (width, height) = (frames.width(), frames.height());
    let loaded = image
        .map(|path| video_ingest::load_bgr(path, (width, height)))
        .transpose()
        .context("failed to load warm-up image")?;
    inspector.warm_up(loaded.as_deref(), width, height)
}
