//! Fieldbus worker: sole owner of the controller connection.
//!
//! Startup handshake, then a fixed-interval loop that mirrors the input bits
//! into the status store and pulses one output bit per queued command.

use std::{sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use fieldbus::{BitAddress, ControllerLink, FieldbusError};
use tracing::{debug, info, info_span, warn};

use crate::inspection::{
    channel::Channel,
    command::{Action, Command},
    status::{FaultOnPanic, SensorBit, SensorSnapshot, StatusStore},
    telemetry,
};

/// How often the handshake re-checks the channel ready flags.
const READY_POLL: Duration = Duration::from_millis(100);

/// Where each signal lives inside the data block.
#[derive(Debug, Clone)]
pub struct PlcLayout {
    pub db: u16,
    /// Bytes read per poll, starting at byte 0.
    pub input_len: u16,
    /// Bytes covering every output bit, starting at byte 0.
    pub output_len: u16,
    pub sensors: [(SensorBit, BitAddress); 8],
    pub bf_accept: BitAddress,
    pub bf_reject: BitAddress,
    pub od_accept: BitAddress,
    pub od_reject: BitAddress,
    pub ready: [BitAddress; 2],
}

impl PlcLayout {
    /// Addresses used on the commissioned line, in data block `db`.
    pub fn plant_default(db: u16) -> Self {
        Self {
            db,
            input_len: 3,
            output_len: 2,
            sensors: [
                (SensorBit::OdGate, BitAddress::new(0, 0)),
                (SensorBit::BfPresence, BitAddress::new(0, 1)),
                (SensorBit::BfGate, BitAddress::new(0, 2)),
                (SensorBit::OdPresence, BitAddress::new(1, 4)),
                (SensorBit::SystemReady, BitAddress::new(1, 6)),
                (SensorBit::SystemMode, BitAddress::new(2, 0)),
                (SensorBit::DiscStatus, BitAddress::new(2, 1)),
                (SensorBit::HeadTrigger, BitAddress::new(2, 2)),
            ],
            bf_accept: BitAddress::new(1, 0),
            bf_reject: BitAddress::new(1, 1),
            od_accept: BitAddress::new(1, 2),
            od_reject: BitAddress::new(1, 3),
            ready: [BitAddress::new(1, 6), BitAddress::new(1, 7)],
        }
    }

    pub fn decode_inputs(&self, image: &[u8]) -> SensorSnapshot {
        let mut snapshot = SensorSnapshot::default();
        for (bit, addr) in &self.sensors {
            snapshot.set(*bit, addr.get(image));
        }
        snapshot
    }

    pub fn output_bit(&self, command: Command) -> BitAddress {
        match (command.channel, command.action) {
            (Channel::Bf, Action::Accept) => self.bf_accept,
            (Channel::Bf, Action::Reject) => self.bf_reject,
            (Channel::Od, Action::Accept) => self.od_accept,
            (Channel::Od, Action::Reject) => self.od_reject,
        }
    }
}

pub struct FieldbusWorker<L: ControllerLink> {
    link: L,
    layout: PlcLayout,
    store: Arc<StatusStore>,
    commands: Receiver<Command>,
    poll_interval: Duration,
}

impl<L: ControllerLink> FieldbusWorker<L> {
    pub fn new(
        link: L,
        layout: PlcLayout,
        store: Arc<StatusStore>,
        commands: Receiver<Command>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            link,
            layout,
            store,
            commands,
            poll_interval,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Connect, wait for both channels, raise the ready bits and disconnect.
    /// Returns false when stopped before the channels became ready.
    pub fn handshake(&mut self) -> Result<bool> {
        self.link.connect().context("handshake connect failed")?;
        while !Channel::ALL.iter().all(|ch| self.store.channel_ready(*ch)) {
            if self.store.should_stop() {
                self.link.disconnect();
                return Ok(false);
            }
            thread::sleep(READY_POLL);
        }
        self.write_ready(true).context("failed to raise ready bits")?;
        self.store.set_overall_ready(true);
        self.link.disconnect();
        info!(db = self.layout.db, "handshake complete");
        Ok(true)
    }

    /// Read the inputs, publish them and dispatch every queued command.
    /// Returns the number of pulses written.
    pub fn poll_once(&mut self) -> Result<usize, FieldbusError> {
        let image = self.link.read_db(self.layout.db, 0, self.layout.input_len)?;
        self.store.publish_sensors(&self.layout.decode_inputs(&image));

        let mut pulses = 0;
        while let Ok(command) = self.commands.try_recv() {
            self.pulse(command)?;
            pulses += 1;
        }
        Ok(pulses)
    }

    /// Read-modify-write the command's bit high, then write it low.
    pub fn pulse(&mut self, command: Command) -> Result<(), FieldbusError> {
        let addr = self.layout.output_bit(command);
        let mut image = self.link.read_db(self.layout.db, 0, self.layout.output_len)?;
        addr.set(&mut image, true)?;
        self.link.write_db(self.layout.db, 0, &image)?;
        addr.set(&mut image, false)?;
        self.link.write_db(self.layout.db, 0, &image)?;
        metrics::counter!("fieldbus_pulses_total", "command" => command.to_string()).increment(1);
        debug!(%command, bit = %addr, "pulse written");
        Ok(())
    }

    pub fn write_ready(&mut self, ready: bool) -> Result<(), FieldbusError> {
        let mut image = self.link.read_db(self.layout.db, 0, self.layout.output_len)?;
        for addr in self.layout.ready {
            addr.set(&mut image, ready)?;
        }
        self.link.write_db(self.layout.db, 0, &image)
    }

    /// Handshake, then poll until stop. Any communication error ends the
    /// worker; there is no reconnect.
    pub fn run(&mut self) -> Result<()> {
        if !self.handshake()? {
            info!("stopped before handshake");
            return Ok(());
        }
        self.link.connect().context("reconnect after handshake failed")?;
        info!(interval_ms = self.poll_interval.as_millis() as u64, "polling controller");

        while !self.store.should_stop() {
            if let Err(err) = self.poll_once() {
                self.link.disconnect();
                return Err(err).context("controller poll failed");
            }
            thread::sleep(self.poll_interval);
        }

        if let Err(err) = self.write_ready(false) {
            warn!("failed to clear ready bits on shutdown: {err}");
        }
        self.link.disconnect();
        info!("controller released");
        Ok(())
    }
}

/// Connect once and decode the current inputs.
pub fn probe<L: ControllerLink>(link: &mut L, layout: &PlcLayout) -> Result<SensorSnapshot> {
    link.connect().context("connect failed")?;
    let image = link.read_db(layout.db, 0, layout.input_len);
    link.disconnect();
    let image = image.with_context(|| format!("failed to read DB{}", layout.db))?;
    Ok(layout.decode_inputs(&image))
}

pub fn spawn_fieldbus_worker<L>(mut worker: FieldbusWorker<L>) -> std::io::Result<thread::JoinHandle<()>>
where
    L: ControllerLink + 'static,
{
    let store = worker.store.clone();
    telemetry::spawn_thread("fieldbus", move || {
        let _guard = FaultOnPanic::new(store.clone(), "fieldbus");
        let _span = info_span!("fieldbus", db = worker.layout.db).entered();
        if let Err(err) = worker.run() {
            store.raise_fault("fieldbus", format!("{err:#}"));
        }
    })
}
