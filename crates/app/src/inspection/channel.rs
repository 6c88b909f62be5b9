use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

/// One of the two independent inspection lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Big face camera.
    Bf,
    /// Outer diameter camera.
    Od,
}

const BF_DEFECTS: [&str; 5] = ["rust", "dent", "damage", "high head", "down head"];
const OD_DEFECTS: [&str; 5] = ["rust", "dent", "damage", "damage on end", "spherical mark"];

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Bf, Channel::Od];

    pub fn label(self) -> &'static str {
        match self {
            Channel::Bf => "BF",
            Channel::Od => "OD",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Channel::Bf => 0,
            Channel::Od => 1,
        }
    }

    /// How many roller markers, newest first, a defect is checked against.
    /// Bounds the scan to rollers that can still be in view.
    pub fn correlation_window(self) -> usize {
        match self {
            Channel::Bf => 2,
            Channel::Od => 3,
        }
    }

    /// Normalised defect names that get their own counter.
    pub fn known_defects(self) -> &'static [&'static str] {
        match self {
            Channel::Bf => &BF_DEFECTS,
            Channel::Od => &OD_DEFECTS,
        }
    }

    pub fn default_read_backoff(self) -> Duration {
        match self {
            Channel::Bf => Duration::from_millis(100),
            Channel::Od => Duration::from_millis(10),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
