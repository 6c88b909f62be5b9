//! Slot control: turns queued decisions into actuator commands, one per gate edge.

use std::{sync::Arc, thread, time::Duration};

use anyhow::{Result, bail};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, info, info_span};

use crate::inspection::{
    channel::Channel,
    command::{Command, Decision},
    status::{FaultOnPanic, RisingEdge, SensorBit, SensorSnapshot, StatusStore},
    telemetry,
};

/// Upper bound on a single wait for the next sensor publish.
const SENSOR_WAIT: Duration = Duration::from_millis(50);

pub struct SlotController {
    channel: Channel,
    gate: SensorBit,
    edge: RisingEdge,
}

impl SlotController {
    pub fn new(channel: Channel, gate: SensorBit) -> Self {
        Self {
            channel,
            gate,
            edge: RisingEdge::default(),
        }
    }

    /// React to one sensor snapshot. On a gate rising edge with a decision
    /// waiting, the matching command is queued and returned.
    pub fn on_sensors(
        &mut self,
        sensors: &SensorSnapshot,
        decisions: &Receiver<Decision>,
        commands: &Sender<Command>,
    ) -> Result<Option<Command>> {
        if !self.edge.update(sensors.get(self.gate)) {
            return Ok(None);
        }
        let decision = match decisions.try_recv() {
            Ok(decision) => decision,
            Err(TryRecvError::Empty) => {
                debug!(channel = %self.channel, "gate edge with no decision queued");
                return Ok(None);
            }
            Err(TryRecvError::Disconnected) => bail!("decision queue disconnected"),
        };
        let command = Command::for_decision(self.channel, &decision);
        if commands.send(command).is_err() {
            bail!("command queue disconnected");
        }
        metrics::counter!("inspect_commands_total", "command" => command.to_string()).increment(1);
        info!(channel = %self.channel, roller = decision.roller_id, %command, "command queued");
        Ok(Some(command))
    }
}

pub fn run_slot_control(
    controller: &mut SlotController,
    store: &StatusStore,
    decisions: &Receiver<Decision>,
    commands: &Sender<Command>,
) -> Result<()> {
    let mut epoch = store.sensor_epoch();
    while !store.should_stop() {
        controller.on_sensors(&store.sensors(), decisions, commands)?;
        epoch = store.wait_for_sensors(epoch, SENSOR_WAIT);
    }
    Ok(())
}

pub fn spawn_slot_worker(
    mut controller: SlotController,
    store: Arc<StatusStore>,
    decisions: Receiver<Decision>,
    commands: Sender<Command>,
) -> std::io::Result<thread::JoinHandle<()>> {
    let name = format!("slot-{}", controller.channel.label().to_lowercase());
    telemetry::spawn_thread(name.clone(), move || {
        let _guard = FaultOnPanic::new(store.clone(), name.clone());
        let _span = info_span!("slot_control", channel = %controller.channel).entered();
        if let Err(err) = run_slot_control(&mut controller, &store, &decisions, &commands) {
            store.raise_fault(&name, format!("{err:#}"));
        }
    })
}
