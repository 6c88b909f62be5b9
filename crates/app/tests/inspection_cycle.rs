mod support;

use crossbeam_channel::unbounded;
use ml_core::BoundingBox;
use roller_inspect::inspection::{
    Channel,
    command::{Action, Command, Decision},
    frame_buffer::ChannelFrames,
    head_shape::HeadType,
    inference::{ChannelInspector, CycleReport, HeadOutcome},
    roller::NO_DEFECT,
    slot_control::SlotController,
    status::{SensorBit, SensorSnapshot, StatusStore},
};
use support::{ScriptedDetector, inspector, raw, roller_marker};

const W: u32 = 320;
const H: u32 = 320;

struct Line {
    inspector: ChannelInspector,
    frames: ChannelFrames,
    store: StatusStore,
    decisions: crossbeam_channel::Sender<Decision>,
    decided: crossbeam_channel::Receiver<Decision>,
    sensors: SensorSnapshot,
    evidence: tempfile::TempDir,
}

impl Line {
    fn new(channel: Channel, detector: ScriptedDetector, head: Option<ScriptedDetector>) -> Self {
        let evidence = tempfile::tempdir().unwrap();
        let (decisions, decided) = unbounded();
        Self {
            inspector: inspector(channel, detector, head, evidence.path()),
            frames: ChannelFrames::new(W, H),
            store: StatusStore::new(false),
            decisions,
            decided,
            sensors: SensorSnapshot::default(),
            evidence,
        }
    }

    fn set(&mut self, bit: SensorBit, level: bool) -> CycleReport {
        self.sensors.set(bit, level);
        self.inspector
            .step(&self.sensors, &self.frames, &self.store, &self.decisions)
            .unwrap()
    }

    fn saved(&self, dir: &str) -> usize {
        std::fs::read_dir(self.evidence.path().join(dir))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    fn pulse(&mut self, bit: SensorBit) {
        self.set(bit, true);
        self.set(bit, false);
    }

    fn new_frame(&mut self) -> CycleReport {
        self.frames
            .raw
            .write(&vec![90; (W * H * 3) as usize])
            .unwrap();
        self.inspector
            .step(&self.sensors, &self.frames, &self.store, &self.decisions)
            .unwrap()
    }
}

fn rust_at(confidence: f32) -> Vec<ml_core::RawDetection> {
    vec![
        roller_marker(0.0, 300.0),
        // 40 x 30 = 1200 px²
        raw(0, confidence, BoundingBox::new(100.0, 100.0, 140.0, 130.0)),
    ]
}

#[test]
fn rust_above_thresholds_marks_roller() {
    let detector = ScriptedDetector::default();
    detector.push(rust_at(0.90));
    let mut line = Line::new(Channel::Bf, detector, None);

    line.pulse(SensorBit::BfPresence);
    let report = line.new_frame();
    assert_eq!(report.detection.unwrap().correlation.attributed.len(), 1);

    let record = line.inspector.ledger().get(1).unwrap();
    assert!(record.defect());
    assert_eq!(record.defect_names(), &[NO_DEFECT.to_string(), "rust".to_string()]);
}

#[test]
fn rust_below_class_threshold_is_dropped() {
    let detector = ScriptedDetector::default();
    detector.push(rust_at(0.70));
    let mut line = Line::new(Channel::Bf, detector, None);

    line.pulse(SensorBit::BfPresence);
    let summary = line.new_frame().detection.unwrap();
    assert!(summary.kept.iter().all(|d| d.label != "rust"));

    let record = line.inspector.ledger().get(1).unwrap();
    assert!(!record.defect());
    assert_eq!(record.defect_names(), &[NO_DEFECT.to_string()]);
}

#[test]
fn defect_without_roller_marker_is_noise() {
    let detector = ScriptedDetector::default();
    detector.push(vec![raw(0, 0.95, BoundingBox::new(100.0, 100.0, 140.0, 130.0))]);
    let mut line = Line::new(Channel::Od, detector, None);

    line.pulse(SensorBit::OdPresence);
    let summary = line.new_frame().detection.unwrap();
    assert_eq!(summary.correlation.unmatched, 1);
    assert_eq!(summary.evidence_saved, 0);
    assert!(!line.inspector.ledger().get(1).unwrap().defect());
}

#[test]
fn finalize_edge_pops_only_the_oldest() {
    let mut line = Line::new(Channel::Bf, ScriptedDetector::default(), None);
    line.pulse(SensorBit::BfPresence);
    line.pulse(SensorBit::BfPresence);
    assert_eq!(line.inspector.ledger().pending(), 2);

    let report = line.set(SensorBit::OdPresence, true);
    assert_eq!(report.finalized.map(|r| r.id()), Some(1));
    // held high over several polls
    line.set(SensorBit::OdPresence, true);
    line.set(SensorBit::OdPresence, true);

    assert_eq!(line.inspector.ledger().pending(), 1);
    assert!(line.inspector.ledger().get(2).is_some());
    assert_eq!(line.decided.try_iter().count(), 1);
    let counters = line.store.counters(Channel::Bf).snapshot(Channel::Bf);
    assert_eq!((counters.inspected, counters.accepted), (1, 1));
}

#[test]
fn high_head_is_folded_like_a_defect() {
    let head = ScriptedDetector::default();
    // inner 200 x 200, outer 500 x 500: offset 150
    head.push(vec![
        raw(0, 0.9, BoundingBox::new(100.0, 100.0, 300.0, 300.0)),
        raw(1, 0.9, BoundingBox::new(0.0, 0.0, 500.0, 500.0)),
    ]);
    let mut line = Line::new(Channel::Bf, ScriptedDetector::default(), Some(head));
    line.frames
        .raw
        .write(&vec![10; (W * H * 3) as usize])
        .unwrap();

    line.pulse(SensorBit::BfPresence);
    let report = line.set(SensorBit::HeadTrigger, true);
    match report.head {
        Some(HeadOutcome::Measured {
            measurement,
            attributed,
        }) => {
            assert_eq!(measurement.offset, 150.0);
            assert_eq!(measurement.head, HeadType::High);
            assert_eq!(attributed, Some(1));
        }
        other => panic!("unexpected head outcome {other:?}"),
    }

    line.set(SensorBit::HeadTrigger, false);
    let finalized = line.set(SensorBit::OdPresence, true).finalized.unwrap();
    assert!(finalized.defect());
    assert!(finalized.defect_names().iter().any(|n| n == "High Head"));

    let counters = line.store.counters(Channel::Bf).snapshot(Channel::Bf);
    assert_eq!(counters.rejected, 1);
    assert_eq!(counters.defects["high head"], 1);
    assert!(line.decided.recv().unwrap().defect_detected);
}

#[test]
fn head_pass_without_reference_is_skipped() {
    let head = ScriptedDetector::default();
    head.push(vec![raw(0, 0.9, BoundingBox::new(100.0, 100.0, 300.0, 300.0))]);
    let mut line = Line::new(Channel::Bf, ScriptedDetector::default(), Some(head));
    line.frames
        .raw
        .write(&vec![10; (W * H * 3) as usize])
        .unwrap();
    line.pulse(SensorBit::BfPresence);
    let report = line.set(SensorBit::HeadTrigger, true);
    assert_eq!(report.head, Some(HeadOutcome::Skipped));
    assert!(!line.inspector.ledger().get(1).unwrap().defect());
}

#[test]
fn decisions_and_commands_keep_roller_order() {
    let detector = ScriptedDetector::default();
    // the leftmost marker stands for the newest roller (#3)
    detector.push(vec![
        roller_marker(0.0, 100.0),
        roller_marker(150.0, 300.0),
        raw(1, 0.9, BoundingBox::new(20.0, 20.0, 60.0, 60.0)),
    ]);
    let mut line = Line::new(Channel::Od, detector, None);
    for _ in 0..3 {
        line.pulse(SensorBit::OdPresence);
    }
    let summary = line.new_frame().detection.unwrap();
    assert_eq!(summary.correlation.attributed, vec![(3, "dent".to_string())]);

    for _ in 0..3 {
        line.pulse(SensorBit::BfGate);
    }
    let decided: Vec<_> = line.decided.try_iter().collect();
    assert_eq!(
        decided.iter().map(|d| d.roller_id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let (dtx, drx) = unbounded();
    let (ctx, crx) = unbounded();
    for decision in decided {
        dtx.send(decision).unwrap();
    }
    let mut slot = SlotController::new(Channel::Od, SensorBit::OdGate);
    let mut gate = SensorSnapshot::default();
    for level in [true, true, false, true, false, true, true] {
        gate.set(SensorBit::OdGate, level);
        slot.on_sensors(&gate, &drx, &ctx).unwrap();
    }
    let commands: Vec<Command> = crx.try_iter().collect();
    assert_eq!(
        commands.iter().map(|c| c.action).collect::<Vec<_>>(),
        vec![Action::Accept, Action::Accept, Action::Reject]
    );
}

fn clean_roller() -> Vec<ml_core::RawDetection> {
    vec![roller_marker(0.0, 300.0)]
}

#[test]
fn archive_mode_keeps_clean_roller_frames() {
    let detector = ScriptedDetector::default();
    detector.push(clean_roller());
    let mut line = Line::new(Channel::Bf, detector, None);
    line.store.set_archive_all(true);

    line.pulse(SensorBit::BfPresence);
    let summary = line.new_frame().detection.unwrap();
    assert_eq!(summary.evidence_saved, 1);
    assert_eq!(line.saved("All/BF/All_BF"), 1);
    assert_eq!(line.saved("BF/Defect"), 0);
}

#[test]
fn clean_roller_leaves_no_image_without_archive_mode() {
    let detector = ScriptedDetector::default();
    detector.push(clean_roller());
    let mut line = Line::new(Channel::Bf, detector, None);

    line.pulse(SensorBit::BfPresence);
    assert_eq!(line.new_frame().detection.unwrap().evidence_saved, 0);
    assert!(!line.evidence.path().join("All").exists());
    assert_eq!(line.saved("BF/Defect"), 0);
}

#[test]
fn archive_mode_copies_defective_heads_only() {
    let head = ScriptedDetector::default();
    // offset 200: normal
    head.push(vec![
        raw(0, 0.9, BoundingBox::new(100.0, 100.0, 300.0, 300.0)),
        raw(1, 0.9, BoundingBox::new(0.0, 0.0, 600.0, 600.0)),
    ]);
    // offset 150: high
    head.push(vec![
        raw(0, 0.9, BoundingBox::new(100.0, 100.0, 300.0, 300.0)),
        raw(1, 0.9, BoundingBox::new(0.0, 0.0, 500.0, 500.0)),
    ]);
    let mut line = Line::new(Channel::Bf, ScriptedDetector::default(), Some(head));
    line.store.set_archive_all(true);
    line.frames
        .raw
        .write(&vec![10; (W * H * 3) as usize])
        .unwrap();

    line.pulse(SensorBit::BfPresence);
    line.pulse(SensorBit::HeadTrigger);
    assert_eq!(line.saved("All/BF/All_Head"), 0);
    assert_eq!(line.saved("BF/Head_Defect"), 0);

    line.pulse(SensorBit::BfPresence);
    line.pulse(SensorBit::HeadTrigger);
    assert_eq!(line.saved("BF/Head_Defect"), 1);
    assert_eq!(line.saved("All/BF/All_Head"), 1);
}

#[test]
fn defective_head_is_not_archived_when_mode_is_off() {
    let head = ScriptedDetector::default();
    head.push(vec![
        raw(0, 0.9, BoundingBox::new(100.0, 100.0, 300.0, 300.0)),
        raw(1, 0.9, BoundingBox::new(0.0, 0.0, 500.0, 500.0)),
    ]);
    let mut line = Line::new(Channel::Bf, ScriptedDetector::default(), Some(head));
    line.frames
        .raw
        .write(&vec![10; (W * H * 3) as usize])
        .unwrap();

    line.pulse(SensorBit::BfPresence);
    line.pulse(SensorBit::HeadTrigger);
    assert_eq!(line.saved("BF/Head_Defect"), 1);
    assert!(!line.evidence.path().join("All").exists());
}
