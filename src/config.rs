use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_ACTOR_NAME: &str = "trigger_actor";
pub const DEFAULT_GATEWAY_ADDR: &str = "127.0.0.1:12300";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no serial port configured and none discovered")]
    NoPort,
}

/// Everything an actor needs, passed in at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    pub name: String,
    pub device: DeviceInfo,
    pub transport: TransportConfig,
    #[serde(rename = "loop")]
    pub loop_timing: LoopConfig,
    pub reprogram: ReprogramConfig,
    pub bus: BusConfig,
}

impl ActorConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_ACTOR_NAME.to_string(),
            device: DeviceInfo::default(),
            transport: TransportConfig::default(),
            loop_timing: LoopConfig::default(),
            reprogram: ReprogramConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub port: String,
    pub serial_number: String,
    pub baud_rate: u32,
    pub pins: BTreeMap<String, u32>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            port: String::new(),
            serial_number: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            pins: default_pins(),
        }
    }
}

/// Output names wired on the standard trigger board.
pub fn default_pins() -> BTreeMap<String, u32> {
    [("Shutter", 0), ("Detectors", 1), ("SDI", 2), ("DSCAN", 3), ("Aux.", 4)]
        .into_iter()
        .map(|(name, index)| (name.to_string(), index))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub arrival_timeout_ms: u64,
    pub settle_window_ms: u64,
    pub poll_tick_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            arrival_timeout_ms: 50,
            settle_window_ms: 100,
            poll_tick_ms: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub waiting_time_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub join_timeout_ms: u64,
}

impl LoopConfig {
    pub fn waiting_time(&self) -> Duration {
        Duration::from_millis(self.waiting_time_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            waiting_time_ms: 100,
            heartbeat_interval_ms: 1000,
            join_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReprogramConfig {
    pub cli_path: String,
    pub fqbn: String,
    pub dtr_low_ms: u64,
    pub reboot_settle_ms: u64,
}

impl Default for ReprogramConfig {
    fn default() -> Self {
        Self {
            cli_path: "arduino-cli".to_string(),
            fqbn: "arduino:avr:uno".to_string(),
            dtr_low_ms: 500,
            reboot_settle_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Replies nobody fetched are dropped after this long.
    pub reply_ttl_ms: u64,
}

impl BusConfig {
    pub fn reply_ttl(&self) -> Duration {
        Duration::from_millis(self.reply_ttl_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { reply_ttl_ms: 600_000 }
    }
}
