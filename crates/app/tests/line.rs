mod support;

use std::{sync::Arc, time::Duration};

use crossbeam_channel::unbounded;
use ml_core::BoundingBox;
use roller_inspect::inspection::{
    Channel,
    command::Decision,
    frame_buffer::ChannelFrames,
    inference::spawn_inference_worker,
    plc::{FieldbusWorker, PlcLayout, spawn_fieldbus_worker},
    slot_control::{SlotController, spawn_slot_worker},
    status::{SensorBit, StatusStore},
};
use support::{MemoryPlc, ScriptedDetector, inspector, raw, roller_marker, wait_until};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn defective_roller_is_rejected_at_the_gate() {
    let evidence = tempfile::tempdir().unwrap();
    let store = Arc::new(StatusStore::new(false));
    let frames = Arc::new(ChannelFrames::new(320, 320));
    let plc = MemoryPlc::new(3);

    let detector = ScriptedDetector::default();
    detector.push(vec![
        roller_marker(0.0, 300.0),
        raw(0, 0.95, BoundingBox::new(100.0, 100.0, 140.0, 130.0)),
    ]);
    let inspector = inspector(Channel::Bf, detector.clone(), None, evidence.path());

    let (decision_tx, decision_rx) = unbounded::<Decision>();
    let (command_tx, command_rx) = unbounded();
    let inference = spawn_inference_worker(
        move || Ok(inspector),
        None,
        frames.clone(),
        store.clone(),
        decision_tx,
        Channel::Bf,
    )
    .unwrap();
    let slot = spawn_slot_worker(
        SlotController::new(Channel::Bf, SensorBit::BfGate),
        store.clone(),
        decision_rx,
        command_tx,
    )
    .unwrap();
    let fieldbus = spawn_fieldbus_worker(FieldbusWorker::new(
        plc.clone(),
        PlcLayout::plant_default(86),
        store.clone(),
        command_rx,
        Duration::from_millis(1),
    ))
    .unwrap();

    // no OD worker in this test
    store.set_channel_ready(Channel::Od, true);
    assert!(wait_until(TIMEOUT, || store.overall_ready()));
    assert_eq!(plc.byte(1) & 0b1100_0000, 0b1100_0000);

    frames.raw.write(&vec![50; 320 * 320 * 3]).unwrap();
    plc.set_bit(0, 1, true); // BF presence
    assert!(wait_until(TIMEOUT, || detector.remaining() == 0));
    assert!(wait_until(TIMEOUT, || frames.annotated.sequence() > 0));
    plc.set_bit(0, 1, false);

    plc.set_bit(1, 4, true); // OD presence finalizes BF
    assert!(wait_until(TIMEOUT, || {
        store.counters(Channel::Bf).snapshot(Channel::Bf).rejected == 1
    }));
    plc.set_bit(1, 4, false);

    plc.set_bit(0, 2, true); // BF gate
    assert!(wait_until(TIMEOUT, || {
        plc.state
            .lock()
            .unwrap()
            .writes
            .iter()
            .any(|w| w[1] & 0b0000_0010 != 0)
    }));

    store.request_shutdown();
    for handle in [inference, slot, fieldbus] {
        handle.join().unwrap();
    }
    assert!(!store.has_fault());
    assert_eq!(plc.byte(1) & 0b1100_0000, 0, "ready bits cleared on shutdown");
    assert_eq!(
        std::fs::read_dir(evidence.path().join("BF/Defect")).unwrap().count(),
        1
    );
}

#[test]
fn lost_connection_raises_fault_and_stops_polling() {
    let store = Arc::new(StatusStore::new(false));
    let plc = MemoryPlc::new(3);
    let (_command_tx, command_rx) = unbounded();
    store.set_channel_ready(Channel::Bf, true);
    store.set_channel_ready(Channel::Od, true);

    let fieldbus = spawn_fieldbus_worker(FieldbusWorker::new(
        plc.clone(),
        PlcLayout::plant_default(86),
        store.clone(),
        command_rx,
        Duration::from_millis(1),
    ))
    .unwrap();

    plc.set_bit(0, 1, true);
    assert!(wait_until(TIMEOUT, || store.sensor(SensorBit::BfPresence)));
    plc.state.lock().unwrap().broken = true;

    fieldbus.join().unwrap();
    let fault = store.fault().expect("fault recorded");
    assert_eq!(fault.worker, "fieldbus");
    assert!(store.should_stop());

    // the last published bits stay as they were
    let epoch = store.sensor_epoch();
    plc.set_bit(0, 1, false);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(store.sensor_epoch(), epoch);
    assert!(store.sensor(SensorBit::BfPresence));
}
