use std::fmt;

use serde::Serialize;

use crate::inspection::channel::Channel;

/// Outcome queued by an inference worker for one finalized roller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub roller_id: u64,
    pub defect_detected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Accept,
    Reject,
}

/// Actuator request consumed by the fieldbus worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Command {
    pub action: Action,
    pub channel: Channel,
}

impl Command {
    pub fn for_decision(channel: Channel, decision: &Decision) -> Self {
        let action = if decision.defect_detected {
            Action::Reject
        } else {
            Action::Accept
        };
        Self { action, channel }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.action {
            Action::Accept => "accept",
            Action::Reject => "reject",
        };
        write!(f, "{action}_{}", self.channel.label().to_lowercase())
    }
}
