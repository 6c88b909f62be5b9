//! Plant configuration: a TOML file describing both channels, their models and
//! the controller, with command-line overrides applied on top.

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::inspection::{channel::Channel, status::SensorBit};

const DEFAULT_INPUT_SIZE: (i64, i64) = (640, 640);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlantConfig {
    #[serde(default = "default_evidence_root")]
    pub evidence_root: PathBuf,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Also archive every cycle that shows a roller marker.
    #[serde(default)]
    pub archive_all: bool,
    /// Threshold catalog file; built-in defaults when absent.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    /// Roller profile used to look up head limits.
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub status_file: Option<PathBuf>,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Operator control file re-read every status interval; currently
    /// carries the archive-everything switch.
    #[serde(default)]
    pub control_file: Option<PathBuf>,
    #[serde(default)]
    pub plc: PlcConfig,
    pub bf: ChannelConfig,
    pub od: ChannelConfig,
    /// Head-shape classifier run on the BF channel.
    #[serde(default)]
    pub head: Option<HeadConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub source: SourceConfig,
    pub width: u32,
    pub height: u32,
    /// Rotate frames by 180 degrees (camera mounted upside down).
    #[serde(default)]
    pub flip: bool,
    #[serde(default)]
    pub read_backoff_ms: Option<u64>,
    pub model: ModelConfig,
    #[serde(default)]
    pub warmup_image: Option<PathBuf>,
    #[serde(default)]
    pub presence_bit: Option<SensorBit>,
    #[serde(default)]
    pub finalize_bit: Option<SensorBit>,
    #[serde(default)]
    pub gate_bit: Option<SensorBit>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Camera index (`"0"`) or stream URI, requires `with-opencv`.
    Camera {
        uri: String,
        #[serde(default = "default_fps")]
        fps: f64,
    },
    /// Directory of still images played back in name order.
    Replay {
        dir: PathBuf,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Key into the threshold catalog; defaults to the file stem.
    #[serde(default)]
    pub name: Option<String>,
    /// Class names indexed by class id.
    #[serde(default)]
    pub classes: Vec<String>,
    /// Class id reported as the roller marker.
    #[serde(default)]
    pub roller_class: Option<i64>,
    #[serde(default = "default_input_size")]
    pub input_size: (i64, i64),
    #[serde(default)]
    pub cpu: bool,
}

impl ModelConfig {
    pub fn catalog_key(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadConfig {
    pub model: ModelConfig,
    #[serde(default = "default_head_trigger")]
    pub trigger_bit: SensorBit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlcConfig {
    #[serde(default = "default_plc_host")]
    pub host: String,
    #[serde(default = "default_plc_port")]
    pub port: u16,
    #[serde(default)]
    pub rack: u8,
    #[serde(default = "default_plc_slot")]
    pub slot: u8,
    #[serde(default = "default_plc_db")]
    pub db: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_plc_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: default_plc_host(),
            port: default_plc_port(),
            rack: 0,
            slot: default_plc_slot(),
            db: default_plc_db(),
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_plc_timeout_ms(),
        }
    }
}

impl PlcConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn endpoint(&self) -> fieldbus::S7Endpoint {
        fieldbus::S7Endpoint::new(self.host.clone(), self.rack, self.slot)
            .with_port(self.port)
            .with_timeout(Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub chrome_trace: Option<PathBuf>,
    #[serde(default)]
    pub metrics_addr: Option<SocketAddr>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub evidence_root: Option<PathBuf>,
    pub plc_host: Option<String>,
    pub archive_all: bool,
    pub chrome_trace: Option<PathBuf>,
    pub metrics_addr: Option<SocketAddr>,
    pub status_file: Option<PathBuf>,
}

/// Sensor bits a channel's workers react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRoles {
    pub presence: SensorBit,
    pub finalize: SensorBit,
    pub gate: SensorBit,
}

impl BitRoles {
    /// Wiring of the plant the line was commissioned with: a BF roller is
    /// finalized when it reaches OD presence, an OD roller at the BF gate.
    pub fn plant_default(channel: Channel) -> Self {
        match channel {
            Channel::Bf => Self {
                presence: SensorBit::BfPresence,
                finalize: SensorBit::OdPresence,
                gate: SensorBit::BfGate,
            },
            Channel::Od => Self {
                presence: SensorBit::OdPresence,
                finalize: SensorBit::BfGate,
                gate: SensorBit::OdGate,
            },
        }
    }
}

impl PlantConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read plant config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("invalid plant config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PlantConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(root) = &overrides.evidence_root {
            self.evidence_root = root.clone();
        }
        if let Some(host) = &overrides.plc_host {
            self.plc.host = host.clone();
        }
        if overrides.archive_all {
            self.archive_all = true;
        }
        if let Some(path) = &overrides.chrome_trace {
            self.telemetry.chrome_trace = Some(path.clone());
        }
        if let Some(addr) = overrides.metrics_addr {
            self.telemetry.metrics_addr = Some(addr);
        }
        if let Some(path) = &overrides.status_file {
            self.status_file = Some(path.clone());
        }
    }

    pub fn channel(&self, channel: Channel) -> &ChannelConfig {
        match channel {
            Channel::Bf => &self.bf,
            Channel::Od => &self.od,
        }
    }

    pub fn roles(&self, channel: Channel) -> BitRoles {
        let defaults = BitRoles::plant_default(channel);
        let cfg = self.channel(channel);
        BitRoles {
            presence: cfg.presence_bit.unwrap_or(defaults.presence),
            finalize: cfg.finalize_bit.unwrap_or(defaults.finalize),
            gate: cfg.gate_bit.unwrap_or(defaults.gate),
        }
    }

    pub fn read_backoff(&self, channel: Channel) -> Duration {
        self.channel(channel)
            .read_backoff_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| channel.default_read_backoff())
    }

    fn validate(&self) -> Result<()> {
        for channel in Channel::ALL {
            let cfg = self.channel(channel);
            if cfg.width == 0 || cfg.height == 0 {
                bail!("{channel}: frame size must be non-zero");
            }
            let (w, h) = cfg.model.input_size;
            if w <= 0 || h <= 0 {
                bail!("{channel}: model input size must be positive");
            }
            let roles = self.roles(channel);
            if roles.presence == roles.finalize {
                bail!("{channel}: presence and finalize bits must differ");
            }
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("jpeg_quality must be within 1..=100");
        }
        if self.plc.poll_interval_ms == 0 {
            bail!("plc.poll_interval_ms must be positive");
        }
        Ok(())
    }
}

fn default_evidence_root() -> PathBuf {
    PathBuf::from("evidence")
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_status_interval_ms() -> u64 {
    500
}

fn default_fps() -> f64 {
    30.0
}

fn default_input_size() -> (i64, i64) {
    DEFAULT_INPUT_SIZE
}

fn default_head_trigger() -> SensorBit {
    SensorBit::HeadTrigger
}

fn default_plc_host() -> String {
    "192.168.0.1".to_string()
}

fn default_plc_port() -> u16 {
    102
}

fn default_plc_slot() -> u8 {
    1
}

fn default_plc_db() -> u16 {
    86
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_plc_timeout_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [bf]
        width = 640
        height = 480
        source = { kind = "replay", dir = "frames/bf" }
        model = { path = "models/bf.pt", classes = ["rust", "dent", "damage", "roller"], roller_class = 3 }

        [od]
        width = 640
        height = 480
        flip = true
        source = { kind = "camera", uri = "1" }
        model = { path = "models/od.pt", name = "od_v2" }
    "#;

    #[test]
    fn test_minimal_file_gets_plant_defaults() {
        let config = PlantConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.plc.db, 86);
        assert_eq!(config.plc.slot, 1);
        assert_eq!(config.roles(Channel::Bf), BitRoles::plant_default(Channel::Bf));
        assert_eq!(config.roles(Channel::Od).finalize, SensorBit::BfGate);
        assert_eq!(config.read_backoff(Channel::Od), Duration::from_millis(10));
        assert_eq!(config.control_file, None);
        assert_eq!(config.bf.model.catalog_key(), "bf");
        assert_eq!(config.od.model.catalog_key(), "od_v2");
        assert_eq!(
            config.od.source,
            SourceConfig::Camera {
                uri: "1".into(),
                fps: 30.0
            }
        );
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = PlantConfig::from_toml_str(MINIMAL).unwrap();
        config.apply(&Overrides {
            evidence_root: Some("/data/evidence".into()),
            plc_host: Some("10.0.0.5".into()),
            archive_all: true,
            ..Overrides::default()
        });
        assert_eq!(config.evidence_root, PathBuf::from("/data/evidence"));
        assert_eq!(config.plc.host, "10.0.0.5");
        assert!(config.archive_all);
    }

    #[test]
    fn test_bit_roles_can_be_rewired() {
        let text = MINIMAL.replace("flip = true", "flip = true\nfinalize_bit = \"od_gate\"\ngate_bit = \"bf_gate\"");
        let config = PlantConfig::from_toml_str(&text).unwrap();
        let roles = config.roles(Channel::Od);
        assert_eq!(roles.finalize, SensorBit::OdGate);
        assert_eq!(roles.gate, SensorBit::BfGate);
    }

    #[test]
    fn test_same_presence_and_finalize_rejected() {
        let text = MINIMAL.replace("flip = true", "flip = true\nfinalize_bit = \"od_presence\"");
        assert!(PlantConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_control_file_is_top_level() {
        let text = format!("control_file = \"/run/inspect/control.toml\"\n{MINIMAL}");
        let config = PlantConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.control_file, Some(PathBuf::from("/run/inspect/control.toml")));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plant.toml");
        fs::write(&path, MINIMAL).unwrap();
        assert!(PlantConfig::load(&path).is_ok());
        assert!(PlantConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
