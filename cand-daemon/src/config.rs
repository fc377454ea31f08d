//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use cand_core::{BridgeConfig, MessageDef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CanConfig {
    /// DBC file describing the bus
    pub dbc: Option<PathBuf>,
    /// SocketCAN interface; a virtual bus is used when absent
    pub interface: Option<String>,
    /// Cycle time in milliseconds by message name, 0 makes a message event-only
    #[serde(default)]
    pub cycle_overrides: BTreeMap<String, u64>,
}

/// Message bus implementation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process bus, reachable through the TCP broker
    #[default]
    Local,
    /// Redis pub/sub server
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default)]
    pub backend: BusBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen: default_listen(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:7420".to_string()
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}

/// Replace cycle times of the named messages before the catalog is built
pub fn apply_cycle_overrides(
    messages: &mut [MessageDef],
    overrides: &BTreeMap<String, u64>,
) -> Result<()> {
    for (name, &cycle_ms) in overrides {
        let Some(message) = messages.iter_mut().find(|m| &m.name == name) else {
            bail!("Cycle time override for unknown message '{}'", name);
        };

        message.cycle_time = (cycle_ms > 0).then(|| Duration::from_millis(cycle_ms));
        log::debug!("Cycle time of {} set to {} ms", name, cycle_ms);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cand_core::{PayloadFormat, RangePolicy};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [can]
            dbc = "vehicle.dbc"
            interface = "can0"

            [can.cycle_overrides]
            VehicleSpeed = 20
            DoorCommand = 0

            [bridge]
            range_policy = "clamp"
            payload_format = "msgpack"
            status_interval_ms = 1000

            [bus]
            backend = "redis"
            redis_url = "redis://bus.local:6379"

            [broker]
            listen = "0.0.0.0:9000"
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.can.dbc, Some(PathBuf::from("vehicle.dbc")));
        assert_eq!(config.can.interface.as_deref(), Some("can0"));
        assert_eq!(config.can.cycle_overrides["VehicleSpeed"], 20);
        assert_eq!(config.bridge.range_policy, RangePolicy::Clamp);
        assert_eq!(config.bridge.status_interval_ms, Some(1000));
        assert_eq!(config.bridge.payload_format, PayloadFormat::Msgpack);
        assert_eq!(config.bridge.tx_topic, "can.tx");
        assert_eq!(config.bus.backend, BusBackend::Redis);
        assert_eq!(config.bus.redis_url, "redis://bus.local:6379");
        assert!(config.broker.enabled);
        assert_eq!(config.broker.listen, "0.0.0.0:9000");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.can.dbc.is_none());
        assert_eq!(config.bridge.range_policy, RangePolicy::Reject);
        assert_eq!(config.broker.listen, "127.0.0.1:7420");
        assert_eq!(config.bus.backend, BusBackend::Local);
        assert_eq!(config.bridge.payload_format, PayloadFormat::Json);
    }

    #[test]
    fn test_load_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[can]\ndbc = \"bus.dbc\"").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.can.dbc, Some(PathBuf::from("bus.dbc")));

        let mut broken = NamedTempFile::new().unwrap();
        writeln!(broken, "[can").unwrap();
        assert!(load_config(broken.path()).is_err());
    }

    #[test]
    fn test_cycle_overrides() {
        let mut messages = vec![
            MessageDef::new(0x100, "VehicleSpeed", 8).with_cycle_time(Duration::from_millis(50)),
            MessageDef::new(0x200, "DoorCommand", 1).with_cycle_time(Duration::from_millis(500)),
        ];

        let overrides = BTreeMap::from([
            ("VehicleSpeed".to_string(), 20),
            ("DoorCommand".to_string(), 0),
        ]);
        apply_cycle_overrides(&mut messages, &overrides).unwrap();
        assert_eq!(messages[0].cycle_time, Some(Duration::from_millis(20)));
        assert_eq!(messages[1].cycle_time, None);

        let unknown = BTreeMap::from([("Nope".to_string(), 10)]);
        assert!(apply_cycle_overrides(&mut messages, &unknown).is_err());
    }
}
