#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use fieldbus::{ControllerLink, FieldbusError};
use ml_core::{BoundingBox, ClassLabels, ClassThresholds, FrameView, ObjectDetector, RawDetection};
use roller_inspect::inspection::{
    Channel,
    config::BitRoles,
    evidence::EvidenceSink,
    head_shape::HeadLimits,
    inference::{ChannelInspector, HeadPass, InspectorParts},
    status::SensorBit,
};

pub const ROLLER_CLASS: i64 = 3;

/// Replays queued detector outputs. A blank frame is what warm-up feeds the
/// detector: it sees nothing and leaves the queue alone.
#[derive(Clone, Default)]
pub struct ScriptedDetector {
    script: Arc<Mutex<VecDeque<Vec<RawDetection>>>>,
}

impl ScriptedDetector {
    pub fn push(&self, detections: Vec<RawDetection>) {
        self.script.lock().unwrap().push_back(detections);
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

impl ObjectDetector for ScriptedDetector {
    fn detect(&mut self, frame: FrameView<'_>, _min_confidence: f32) -> Result<Vec<RawDetection>> {
        if frame.data.iter().all(|b| *b == 0) {
            return Ok(Vec::new());
        }
        Ok(self.script.lock().unwrap().pop_front().unwrap_or_default())
    }
}

pub fn raw(class_id: i64, score: f32, bbox: BoundingBox) -> RawDetection {
    RawDetection {
        bbox,
        class_id,
        score,
    }
}

pub fn roller_marker(x1: f32, x2: f32) -> RawDetection {
    raw(ROLLER_CLASS, 0.95, BoundingBox::new(x1, 0.0, x2, 300.0))
}

pub fn labels() -> ClassLabels {
    ClassLabels::new(
        vec!["rust".into(), "dent".into(), "damage".into(), "roller".into()],
        Some(ROLLER_CLASS),
    )
}

/// rust: 80 % and 1000 px².
pub fn rust_thresholds() -> ClassThresholds {
    ClassThresholds::new(
        HashMap::from([("rust".to_string(), 80)]),
        HashMap::from([("rust".to_string(), 1000)]),
        0.25,
    )
}

pub fn inspector(
    channel: Channel,
    detector: ScriptedDetector,
    head: Option<ScriptedDetector>,
    evidence: &Path,
) -> ChannelInspector {
    ChannelInspector::new(InspectorParts {
        channel,
        detector: Box::new(detector),
        head: head.map(|detector| HeadPass {
            detector: Box::new(detector),
            limits: HeadLimits::default(),
            trigger: SensorBit::HeadTrigger,
        }),
        labels: labels(),
        thresholds: rust_thresholds(),
        roles: BitRoles::plant_default(channel),
        evidence: EvidenceSink::new(evidence, 80),
    })
}

#[derive(Debug, Default)]
pub struct PlcState {
    pub block: Vec<u8>,
    pub connected: bool,
    /// Every read and write fails while set.
    pub broken: bool,
    pub writes: Vec<Vec<u8>>,
    pub reads: usize,
}

/// In-memory data block shared with the test body.
#[derive(Clone)]
pub struct MemoryPlc {
    pub state: Arc<Mutex<PlcState>>,
}

impl MemoryPlc {
    pub fn new(len: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlcState {
                block: vec![0; len],
                ..PlcState::default()
            })),
        }
    }

    pub fn set_bit(&self, byte: usize, bit: u8, value: bool) {
        let mut state = self.state.lock().unwrap();
        if value {
            state.block[byte] |= 1 << bit;
        } else {
            state.block[byte] &= !(1 << bit);
        }
    }

    pub fn byte(&self, index: usize) -> u8 {
        self.state.lock().unwrap().block[index]
    }

    pub fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }
}

impl ControllerLink for MemoryPlc {
    fn connect(&mut self) -> Result<(), FieldbusError> {
        let mut state = self.state.lock().unwrap();
        if state.broken {
            return Err(FieldbusError::Protocol("link down".into()));
        }
        state.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state.lock().unwrap().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn read_db(&mut self, _db: u16, start: u32, len: u16) -> Result<Vec<u8>, FieldbusError> {
        let mut state = self.state.lock().unwrap();
        if state.broken {
            state.connected = false;
            return Err(FieldbusError::NotConnected);
        }
        if !state.connected {
            return Err(FieldbusError::NotConnected);
        }
        state.reads += 1;
        let start = start as usize;
        Ok(state.block[start..start + len as usize].to_vec())
    }

    fn write_db(&mut self, _db: u16, start: u32, data: &[u8]) -> Result<(), FieldbusError> {
        let mut state = self.state.lock().unwrap();
        if state.broken || !state.connected {
            return Err(FieldbusError::NotConnected);
        }
        let start = start as usize;
        state.block[start..start + data.len()].copy_from_slice(data);
        state.writes.push(data.to_vec());
        Ok(())
    }
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    check()
}
