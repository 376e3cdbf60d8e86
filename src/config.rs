//! Reader configuration
//!
//! Every field has a default, so an empty (or absent) TOML file describes the stock setup:
//! an SLCAN adapter at 500kbps, reading DIDs 0xFA13..=0xFA15 with 11bit functional,
//! 11bit physical and 29bit functional addressing in that order.

use std::{path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    addressing::PlanConfig,
    aggregator::CollectSettings,
    channel::IsoTPSettings,
    hardware::{InterfaceKind, SLCAN_BITRATES},
    uds::DataIdentifier,
};

/// Configuration error, reported before any request is sent
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("cannot read config file '{}'", path.display())]
    Io {
        /// Config file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Config file is not valid TOML for [ReaderConfig]
    #[error("invalid config file")]
    Parse(
        #[from]
        #[source]
        toml::de::Error,
    ),
    /// An identifier does not fit the addressing mode
    #[error("{name} 0x{id:X} is outside the 11bit identifier range")]
    IdOutOfRange {
        /// Parameter name
        name: &'static str,
        /// Offending value
        id: u32,
    },
    /// Parameters that cannot be used together
    #[error("contradictory configuration: {0}")]
    Contradictory(String),
    /// Bit rate the interface cannot use
    #[error("unsupported bit rate {0} for this interface")]
    UnsupportedBitrate(u32),
}

/// CAN interface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Adapter type
    pub interface: InterfaceKind,
    /// Serial port (slcan) or network interface (socketcan)
    pub channel: String,
    /// CAN bit rate
    pub bitrate: u32,
    /// Serial line speed of SLCAN adapters
    pub serial_baud: u32,
    /// Frames kept while waiting for an SLCAN acknowledge
    pub rx_queue_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            interface: InterfaceKind::Slcan,
            channel: "/dev/ttyACM0".into(),
            bitrate: 500_000,
            serial_baud: 115_200,
            rx_queue_limit: 1000,
        }
    }
}

/// Response timing
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Deadline for a positive response, counted from the request
    pub response_timeout_ms: u64,
    /// Longest wait on one receive channel per polling round
    pub poll_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
            poll_interval_ms: 1,
        }
    }
}

/// Template locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Directory holding `did_<key>.csv` templates and the README
    pub format_dir: PathBuf,
    /// Directory annotated files are written to
    pub result_dir: PathBuf,
    /// Documentation file copied once per run
    pub readme: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            format_dir: "format".into(),
            result_dir: "result".into(),
            readme: "README.md".into(),
        }
    }
}

fn default_dids() -> Vec<DataIdentifier> {
    vec![0xFA13, 0xFA14, 0xFA15]
}

fn default_plans() -> Vec<PlanConfig> {
    vec![
        PlanConfig::functional_11bit(),
        PlanConfig::physical_11bit(),
        PlanConfig::functional_29bit(),
    ]
}

/// Complete reader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// CAN interface
    #[serde(default)]
    pub bus: BusConfig,
    /// ISO-TP parameters of every channel
    #[serde(default)]
    pub isotp: IsoTPSettings,
    /// Response timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Template locations
    #[serde(default)]
    pub templates: TemplateConfig,
    /// Identifiers to read, in order
    #[serde(default = "default_dids")]
    pub dids: Vec<DataIdentifier>,
    /// Addressing plans, in order
    #[serde(default = "default_plans")]
    pub plans: Vec<PlanConfig>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            isotp: IsoTPSettings::default(),
            timing: TimingConfig::default(),
            templates: TemplateConfig::default(),
            dids: default_dids(),
            plans: default_plans(),
        }
    }
}

impl ReaderConfig {
    /// Parses a TOML document
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Loads a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Returns true if any plan uses 29bit identifiers
    pub fn uses_extended_ids(&self) -> bool {
        self.plans
            .iter()
            .any(|p| matches!(p, PlanConfig::Functional29Bit { .. }))
    }

    /// Timing and ISO-TP settings of a single read
    pub fn collect_settings(&self) -> CollectSettings {
        CollectSettings {
            timeout: Duration::from_millis(self.timing.response_timeout_ms),
            poll_interval: Duration::from_millis(self.timing.poll_interval_ms),
            isotp: self.isotp,
        }
    }

    /// Checks for contradictory or unusable parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timing;
        if t.response_timeout_ms == 0 || t.poll_interval_ms == 0 {
            return Err(ConfigError::Contradictory(
                "timeouts must be greater than zero".into(),
            ));
        }
        if t.poll_interval_ms >= t.response_timeout_ms {
            return Err(ConfigError::Contradictory(format!(
                "poll interval {}ms is not shorter than the response timeout {}ms",
                t.poll_interval_ms, t.response_timeout_ms
            )));
        }
        if self.dids.is_empty() {
            return Err(ConfigError::Contradictory("no DIDs to read".into()));
        }
        if self.plans.is_empty() {
            return Err(ConfigError::Contradictory("no addressing plans".into()));
        }
        if self.bus.bitrate == 0
            || (self.bus.interface == InterfaceKind::Slcan
                && !SLCAN_BITRATES.contains(&self.bus.bitrate))
        {
            return Err(ConfigError::UnsupportedBitrate(self.bus.bitrate));
        }
        if self.isotp.max_frame_size < 8 {
            return Err(ConfigError::Contradictory(format!(
                "max_frame_size {} cannot hold a multi frame payload",
                self.isotp.max_frame_size
            )));
        }
        self.plans.iter().try_for_each(|p| p.validate())
    }
}
