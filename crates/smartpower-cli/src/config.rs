//! Configuration file – `smartpower.toml`.
//!
//! ```toml
//! [gateway]
//! listen_addr = "0.0.0.0:8860"
//! decode_policy = "skip-frame"
//!
//! [topics]
//! status = "/smartpower/status"
//!
//! [bus]
//! kind = "mqtt"
//! host = "broker.local"
//! port = 1883
//! ```
//!
//! Every key is optional; absent keys keep their defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use smartpower_gateway::config::{GatewayConfig, TopicTable};
use smartpower_middleware::{MqttConfig, QoS};
use smartpower_types::GatewayError;

pub const CONFIG_ENV: &str = "SMARTPOWER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "smartpower.toml";

/// Which [`MessageBus`](smartpower_middleware::MessageBus) backs the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// External MQTT broker.
    #[default]
    Mqtt,
    /// In-process bus; nothing leaves the process.  Useful for bench tests.
    Local,
}

impl std::str::FromStr for BusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(BusKind::Mqtt),
            "local" => Ok(BusKind::Local),
            other => Err(format!("unknown bus kind {other:?}")),
        }
    }
}

/// `[bus]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    /// QoS for the command subscription.
    pub command_qos: QoS,
    #[serde(flatten)]
    pub mqtt: MqttConfig,
}

/// Whole config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub topics: TopicTable,
    pub bus: BusConfig,
}

impl Config {
    /// Gateway settings with `bus.command_qos` folded in.
    pub fn effective_gateway(&self) -> GatewayConfig {
        GatewayConfig {
            command_qos: self.bus.command_qos,
            ..self.gateway.clone()
        }
    }

    /// Broker settings with `gateway.publish_timeout_ms` folded in.
    pub fn effective_mqtt(&self) -> MqttConfig {
        MqttConfig {
            publish_timeout_ms: self.gateway.publish_timeout_ms,
            ..self.bus.mqtt.clone()
        }
    }
}

/// Pick the config file: `--config`, then `$SMARTPOWER_CONFIG`, then
/// `./smartpower.toml`.
pub fn resolve_path(cli: Option<PathBuf>, env: Option<String>) -> PathBuf {
    cli.or_else(|| env.filter(|v| !v.trim().is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Resolve, load, and apply environment overrides.
pub fn load(cli: Option<PathBuf>) -> Result<(Config, PathBuf), GatewayError> {
    let path = resolve_path(cli, std::env::var(CONFIG_ENV).ok());
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok((cfg, path))
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, GatewayError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| GatewayError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `SMARTPOWER_*` environment overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SMARTPOWER_LISTEN_ADDR` | `gateway.listen_addr` |
/// | `SMARTPOWER_MQTT_HOST` | `bus.host` |
/// | `SMARTPOWER_MQTT_PORT` | `bus.port` |
/// | `SMARTPOWER_MQTT_CLIENT_ID` | `bus.client_id` |
/// | `SMARTPOWER_BUS_KIND` | `bus.kind` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SMARTPOWER_LISTEN_ADDR") {
        cfg.gateway.listen_addr = v;
    }
    if let Some(v) = lookup("SMARTPOWER_MQTT_HOST") {
        cfg.bus.mqtt.host = v;
    }
    if let Some(v) = lookup("SMARTPOWER_MQTT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.bus.mqtt.port = port;
    }
    if let Some(v) = lookup("SMARTPOWER_MQTT_CLIENT_ID") {
        cfg.bus.mqtt.client_id = v;
    }
    if let Some(v) = lookup("SMARTPOWER_BUS_KIND")
        && let Ok(kind) = v.parse::<BusKind>()
    {
        cfg.bus.kind = kind;
    }
}
