//! Shared status store.
//!
//! Every field has a single writer role; the fault record is the one field any
//! worker may write. Readers poll, except that sensor consumers can block on
//! [`StatusStore::wait_for_sensors`] until the fieldbus worker publishes again.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::inspection::{channel::Channel, roller::Tally};

/// Sensor bits mirrored from the controller data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorBit {
    BfPresence,
    BfGate,
    OdPresence,
    OdGate,
    HeadTrigger,
    SystemMode,
    DiscStatus,
    SystemReady,
}

impl SensorBit {
    pub const ALL: [SensorBit; 8] = [
        SensorBit::BfPresence,
        SensorBit::BfGate,
        SensorBit::OdPresence,
        SensorBit::OdGate,
        SensorBit::HeadTrigger,
        SensorBit::SystemMode,
        SensorBit::DiscStatus,
        SensorBit::SystemReady,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorBit::BfPresence => "bf_presence",
            SensorBit::BfGate => "bf_gate",
            SensorBit::OdPresence => "od_presence",
            SensorBit::OdGate => "od_gate",
            SensorBit::HeadTrigger => "head_trigger",
            SensorBit::SystemMode => "system_mode",
            SensorBit::DiscStatus => "disc_status",
            SensorBit::SystemReady => "system_ready",
        }
    }
}

/// Copy of all sensor bits taken at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorSnapshot {
    bits: [bool; 8],
}

impl SensorSnapshot {
    pub fn get(&self, bit: SensorBit) -> bool {
        self.bits[bit.index()]
    }

    pub fn set(&mut self, bit: SensorBit, value: bool) {
        self.bits[bit.index()] = value;
    }

    pub fn with(mut self, bit: SensorBit, value: bool) -> Self {
        self.set(bit, value);
        self
    }

    pub fn to_map(&self) -> BTreeMap<SensorBit, bool> {
        SensorBit::ALL.iter().map(|bit| (*bit, self.get(*bit))).collect()
    }
}

/// Turns a polled level into one event per low-to-high transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct RisingEdge {
    previous: bool,
}

impl RisingEdge {
    pub fn update(&mut self, level: bool) -> bool {
        let rose = level && !self.previous;
        self.previous = level;
        rose
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub worker: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Running totals for one channel. Written only by that channel's inference worker.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    inspected: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    defects: [AtomicU64; 5],
    others: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub inspected: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub defects: BTreeMap<String, u64>,
    pub others: u64,
}

impl ChannelCounters {
    pub fn record(&self, channel: Channel, tally: &Tally) {
        self.inspected.fetch_add(1, Ordering::Relaxed);
        if tally.accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        for kind in &tally.known {
            if let Some(idx) = channel.known_defects().iter().position(|k| k == kind) {
                self.defects[idx].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.others.fetch_add(tally.others as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, channel: Channel) -> CounterSnapshot {
        let defects = channel
            .known_defects()
            .iter()
            .enumerate()
            .map(|(idx, kind)| (kind.to_string(), self.defects[idx].load(Ordering::Relaxed)))
            .collect();
        CounterSnapshot {
            inspected: self.inspected.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            defects,
            others: self.others.load(Ordering::Relaxed),
        }
    }
}

pub struct StatusStore {
    sensors: [AtomicBool; 8],
    sensor_epoch: Mutex<u64>,
    sensor_published: Condvar,
    channel_ready: [AtomicBool; 2],
    overall_ready: AtomicBool,
    counters: [ChannelCounters; 2],
    archive_all: AtomicBool,
    shutdown: AtomicBool,
    fault_raised: AtomicBool,
    fault: Mutex<Option<Fault>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub taken_at: DateTime<Utc>,
    pub sensors: BTreeMap<SensorBit, bool>,
    pub sensor_epoch: u64,
    pub ready: BTreeMap<Channel, bool>,
    pub overall_ready: bool,
    pub archive_all: bool,
    pub counters: BTreeMap<Channel, CounterSnapshot>,
    pub error: bool,
    pub fault: Option<Fault>,
}

impl StatusStore {
    pub fn new(archive_all: bool) -> Self {
        Self {
            sensors: Default::default(),
            sensor_epoch: Mutex::new(0),
            sensor_published: Condvar::new(),
            channel_ready: Default::default(),
            overall_ready: AtomicBool::new(false),
            counters: Default::default(),
            archive_all: AtomicBool::new(archive_all),
            shutdown: AtomicBool::new(false),
            fault_raised: AtomicBool::new(false),
            fault: Mutex::new(None),
        }
    }

    pub fn sensor(&self, bit: SensorBit) -> bool {
        self.sensors[bit.index()].load(Ordering::Acquire)
    }

    pub fn sensors(&self) -> SensorSnapshot {
        let mut snapshot = SensorSnapshot::default();
        for bit in SensorBit::ALL {
            snapshot.set(bit, self.sensor(bit));
        }
        snapshot
    }

    /// Fieldbus worker only. Stores every bit, then wakes blocked consumers.
    pub fn publish_sensors(&self, snapshot: &SensorSnapshot) {
        for bit in SensorBit::ALL {
            self.sensors[bit.index()].store(snapshot.get(bit), Ordering::Release);
        }
        let mut epoch = self.sensor_epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch = epoch.wrapping_add(1);
        self.sensor_published.notify_all();
    }

    pub fn sensor_epoch(&self) -> u64 {
        *self.sensor_epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the epoch moves past `seen`, a stop is requested or
    /// `timeout` elapses. Returns the current epoch.
    pub fn wait_for_sensors(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = self.sensor_epoch.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .sensor_published
            .wait_timeout_while(guard, timeout, |epoch| {
                *epoch == seen && !self.should_stop()
            })
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    pub fn set_channel_ready(&self, channel: Channel, ready: bool) {
        self.channel_ready[channel.index()].store(ready, Ordering::Release);
    }

    pub fn channel_ready(&self, channel: Channel) -> bool {
        self.channel_ready[channel.index()].load(Ordering::Acquire)
    }

    pub fn all_channels_ready(&self) -> bool {
        Channel::ALL.iter().all(|ch| self.channel_ready(*ch))
    }

    pub fn set_overall_ready(&self, ready: bool) {
        self.overall_ready.store(ready, Ordering::Release);
    }

    pub fn overall_ready(&self) -> bool {
        self.overall_ready.load(Ordering::Acquire)
    }

    pub fn counters(&self, channel: Channel) -> &ChannelCounters {
        &self.counters[channel.index()]
    }

    /// Returns the previous setting.
    pub fn set_archive_all(&self, enabled: bool) -> bool {
        self.archive_all.swap(enabled, Ordering::Relaxed)
    }

    pub fn archive_all(&self) -> bool {
        self.archive_all.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_waiters();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Record a fault. Only the first one is kept; returns whether this call won.
    pub fn raise_fault(&self, worker: &str, message: impl Into<String>) -> bool {
        let message = message.into();
        let first = {
            let mut slot = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(Fault {
                    worker: worker.to_string(),
                    message: message.clone(),
                    at: Utc::now(),
                });
                true
            } else {
                false
            }
        };
        self.fault_raised.store(true, Ordering::SeqCst);
        error!(worker, error = %message, first, "worker fault raised");
        self.wake_waiters();
        first
    }

    pub fn has_fault(&self) -> bool {
        self.fault_raised.load(Ordering::SeqCst)
    }

    pub fn fault(&self) -> Option<Fault> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn should_stop(&self) -> bool {
        self.shutdown_requested() || self.has_fault()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            taken_at: Utc::now(),
            sensors: self.sensors().to_map(),
            sensor_epoch: self.sensor_epoch(),
            ready: Channel::ALL
                .iter()
                .map(|ch| (*ch, self.channel_ready(*ch)))
                .collect(),
            overall_ready: self.overall_ready(),
            archive_all: self.archive_all(),
            counters: Channel::ALL
                .iter()
                .map(|ch| (*ch, self.counters(*ch).snapshot(*ch)))
                .collect(),
            error: self.has_fault(),
            fault: self.fault(),
        }
    }

    fn wake_waiters(&self) {
        let _guard = self.sensor_epoch.lock().unwrap_or_else(PoisonError::into_inner);
        self.sensor_published.notify_all();
    }
}

/// Raises a fault for `worker` if the owning thread unwinds.
pub struct FaultOnPanic {
    store: Arc<StatusStore>,
    worker: String,
}

impl FaultOnPanic {
    pub fn new(store: Arc<StatusStore>, worker: impl Into<String>) -> Self {
        Self {
            store,
            worker: worker.into(),
        }
    }
}

impl Drop for FaultOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.store.raise_fault(&self.worker, "worker thread panicked");
        }
    }
}
