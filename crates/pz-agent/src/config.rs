//! Gateway configuration, loadable from TOML with `PZ_*` environment
//! overrides.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Deserialize;

use pz_mqtt_channel::MqttConfig;
use pz_protocol::{DeviceDescriptor, TopicSet};

use crate::error::ConfigError;
use crate::link::{LinkPolicy, NetworkCredentials};

/// Shortest keep-alive the broker session accepts.
const MIN_KEEPALIVE_SECS: u16 = 5;

/// Top-level configuration for the gateway agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub network: NetworkConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicSet,
    /// Relay channel ids, in discovery order.
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    #[serde(default)]
    pub device: DeviceConfig,
    /// Sensor sampling interval in seconds.
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,
    /// Status report interval in seconds.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Upper bound on a single link attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_retry_initial")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
}

/// Metadata for the discovery device block.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_manufacturer")]
    pub manufacturer: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            model: default_model(),
            manufacturer: default_manufacturer(),
        }
    }
}

fn default_relays() -> Vec<String> {
    vec!["relay1".to_string(), "relay2".to_string()]
}

fn default_telemetry_interval() -> u64 {
    10
}

fn default_status_interval() -> u64 {
    60
}

fn default_hostname() -> String {
    "pzem-esp32".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_retry_initial() -> u64 {
    500
}

fn default_retry_max() -> u64 {
    60
}

fn default_device_name() -> String {
    "Energy Monitor".to_string()
}

fn default_model() -> String {
    "PZEM-004T".to_string()
}

fn default_manufacturer() -> String {
    "Peacefair".to_string()
}

impl AgentConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// File, then process environment, then validation.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PZ_*` overrides. `lookup` returns the value of a variable
    /// when it is set.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PZ_WIFI_SSID") {
            self.network.ssid = v;
        }
        if let Some(v) = lookup("PZ_WIFI_PASSWORD") {
            self.network.password = v;
        }
        if let Some(v) = lookup("PZ_HOSTNAME") {
            self.network.hostname = v;
        }
        if let Some(v) = lookup("PZ_MQTT_HOST") {
            self.mqtt.broker_host = v;
        }
        if let Some(v) = lookup("PZ_MQTT_PORT") {
            self.mqtt.broker_port = v.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                var: "PZ_MQTT_PORT",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("PZ_MQTT_USERNAME") {
            self.mqtt.username = v;
        }
        if let Some(v) = lookup("PZ_MQTT_PASSWORD") {
            self.mqtt.password = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.ssid.trim().is_empty() {
            return Err(ConfigError::Empty("network.ssid"));
        }
        if self.network.hostname.trim().is_empty() {
            return Err(ConfigError::Empty("network.hostname"));
        }
        if self.mqtt.broker_host.trim().is_empty() {
            return Err(ConfigError::Empty("mqtt.broker_host"));
        }
        if self.mqtt.broker_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.mqtt.keepalive_secs < MIN_KEEPALIVE_SECS {
            return Err(ConfigError::KeepaliveTooShort(self.mqtt.keepalive_secs));
        }
        if self.telemetry_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("telemetry_interval_secs"));
        }
        if self.status_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval("status_interval_secs"));
        }
        if self.network.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroInterval("network.connect_timeout_secs"));
        }
        let backoffs = [
            ("mqtt.reconnect_initial_ms", self.mqtt.reconnect_initial_ms),
            ("mqtt.reconnect_max_secs", self.mqtt.reconnect_max_secs),
            ("network.retry_initial_ms", self.network.retry_initial_ms),
            ("network.retry_max_secs", self.network.retry_max_secs),
        ];
        if let Some((field, _)) = backoffs.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroInterval(*field));
        }
        if self.topics.sensors.is_empty() {
            return Err(ConfigError::Empty("topics.sensors"));
        }

        let mut seen = BTreeSet::new();
        let channels = self.topics.sensors.keys().chain(self.relays.iter());
        for channel in channels {
            if !is_valid_channel_id(channel) {
                return Err(ConfigError::InvalidChannelId(channel.clone()));
            }
            if !seen.insert(channel.as_str()) {
                return Err(ConfigError::DuplicateChannel(channel.clone()));
            }
        }

        for (channel, topic) in &self.topics.sensors {
            check_publish_topic(channel, topic)?;
        }
        check_publish_topic("topics.relay", &self.topics.relay)?;
        check_publish_topic("topics.availability", &self.topics.availability)?;
        check_publish_topic("topics.status", &self.topics.status)?;
        check_publish_topic("topics.discovery_prefix", &self.topics.discovery_prefix)?;
        Ok(())
    }

    /// MQTT client id: explicit setting, else the hostname.
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.network.hostname.clone())
    }

    /// Hostname reduced to `[a-z0-9_]`, used in discovery unique ids.
    pub fn node_id(&self) -> String {
        self.network
            .hostname
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn device_descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            identifiers: vec![self.node_id()],
            name: self.device.name.clone(),
            model: self.device.model.clone(),
            manufacturer: self.device.manufacturer.clone(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn credentials(&self) -> NetworkCredentials {
        NetworkCredentials {
            ssid: self.network.ssid.clone(),
            password: self.network.password.clone(),
            hostname: self.network.hostname.clone(),
        }
    }

    pub fn link_policy(&self) -> LinkPolicy {
        LinkPolicy {
            attempt_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            retry_initial: Duration::from_millis(self.network.retry_initial_ms),
            retry_max: Duration::from_secs(self.network.retry_max_secs),
        }
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

fn is_valid_channel_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Publish topics must be non-empty and wildcard-free.
fn check_publish_topic(name: &str, topic: &str) -> Result<(), ConfigError> {
    let trimmed = topic.trim_end_matches('/');
    if trimmed.is_empty() || topic.contains(['+', '#']) {
        return Err(ConfigError::InvalidTopic {
            name: name.to_string(),
            topic: topic.to_string(),
        });
    }
    Ok(())
}
