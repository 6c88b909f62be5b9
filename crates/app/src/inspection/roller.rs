//! Per-channel roller ledger.

use std::collections::{BTreeMap, BTreeSet};

pub const NO_DEFECT: &str = "No defect";

/// A roller between its presence edge and its finalization edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollerRecord {
    id: u64,
    defect: bool,
    defect_names: Vec<String>,
}

impl RollerRecord {
    fn new(id: u64) -> Self {
        Self {
            id,
            defect: false,
            defect_names: vec![NO_DEFECT.to_string()],
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn defect(&self) -> bool {
        self.defect
    }

    pub fn defect_names(&self) -> &[String] {
        &self.defect_names
    }
}

/// Pending rollers of one channel, ordered by identity.
///
/// Identities start at 1 and are never reused. `defect` only turns true
/// through [`RollerLedger::attribute`], which appends the name at the same time.
#[derive(Debug, Default)]
pub struct RollerLedger {
    last_id: u64,
    pending: BTreeMap<u64, RollerRecord>,
}

impl RollerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly arrived roller and return its identity.
    pub fn admit(&mut self) -> u64 {
        self.last_id += 1;
        self.pending.insert(self.last_id, RollerRecord::new(self.last_id));
        self.last_id
    }

    /// Identity handed out most recently, zero before the first roller.
    pub fn newest_id(&self) -> u64 {
        self.last_id
    }

    /// Mark `id` defective. Returns false when `id` is no longer pending.
    pub fn attribute(&mut self, id: u64, defect_name: &str) -> bool {
        match self.pending.get_mut(&id) {
            Some(record) => {
                record.defect = true;
                record.defect_names.push(defect_name.to_string());
                true
            }
            None => false,
        }
    }

    pub fn pop_oldest(&mut self) -> Option<RollerRecord> {
        self.pending.pop_first().map(|(_, record)| record)
    }

    pub fn get(&self, id: u64) -> Option<&RollerRecord> {
        self.pending.get(&id)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Counter increments derived from one finalized roller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub accepted: bool,
    /// Distinct known defect kinds found on the roller.
    pub known: Vec<&'static str>,
    /// Distinct names that are neither known kinds nor "no defect".
    pub others: u32,
}

fn normalise(name: &str) -> String {
    name.trim().to_lowercase().replace('_', " ")
}

pub fn tally(record: &RollerRecord, known_kinds: &[&'static str]) -> Tally {
    let distinct: BTreeSet<String> = record.defect_names.iter().map(|n| normalise(n)).collect();
    let no_defect = normalise(NO_DEFECT);
    let mut known = Vec::new();
    let mut others = 0;
    for name in distinct.iter().filter(|n| **n != no_defect) {
        match known_kinds.iter().find(|kind| **kind == name.as_str()) {
            Some(kind) => known.push(*kind),
            None => others += 1,
        }
    }
    Tally {
        accepted: !record.defect,
        known,
        others,
    }
}
