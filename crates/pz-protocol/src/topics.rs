//! MQTT topic layout for the energy gateway.
//!
//! Topic structure (defaults):
//! ```text
//! home/energy/pzem1                      telemetry, one topic per meter
//! home/relay/{channel}/set               relay command (ON/OFF)
//! home/relay/set                         relay command, channel in payload
//! home/relay/{channel}/state             relay state confirmation (retained)
//! home/energy/gateway/availability       online/offline (retained, last-will)
//! home/energy/gateway/status             periodic device status
//! homeassistant/{component}/{unique_id}/config   discovery (retained)
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical channel → topic mapping. Keys are fixed, values configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSet {
    /// PZEM channel id → telemetry topic.
    #[serde(default = "default_sensors")]
    pub sensors: BTreeMap<String, String>,
    /// Base for relay command/state topics. A trailing `/` is tolerated.
    #[serde(default = "default_relay")]
    pub relay: String,
    #[serde(default = "default_availability")]
    pub availability: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
}

fn default_sensors() -> BTreeMap<String, String> {
    (1..=3)
        .map(|i| (format!("pzem{i}"), format!("home/energy/pzem{i}")))
        .collect()
}

fn default_relay() -> String {
    "home/relay/".to_string()
}

fn default_availability() -> String {
    "home/energy/gateway/availability".to_string()
}

fn default_status() -> String {
    "home/energy/gateway/status".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

impl Default for TopicSet {
    fn default() -> Self {
        Self {
            sensors: default_sensors(),
            relay: default_relay(),
            availability: default_availability(),
            status: default_status(),
            discovery_prefix: default_discovery_prefix(),
        }
    }
}

impl TopicSet {
    /// Telemetry topic for a sensor channel.
    pub fn sensor(&self, channel: &str) -> Option<&str> {
        self.sensors.get(channel).map(String::as_str)
    }

    fn relay_base(&self) -> &str {
        self.relay.trim_end_matches('/')
    }

    pub fn relay_command(&self, channel: &str) -> String {
        format!("{}/{channel}/set", self.relay_base())
    }

    pub fn relay_state(&self, channel: &str) -> String {
        format!("{}/{channel}/state", self.relay_base())
    }

    /// Shared command topic; the channel id travels in the payload.
    pub fn relay_shared_command(&self) -> String {
        format!("{}/set", self.relay_base())
    }

    /// Filters the command subscriber listens on.
    pub fn relay_command_filters(&self) -> Vec<String> {
        vec![
            format!("{}/+/set", self.relay_base()),
            self.relay_shared_command(),
        ]
    }

    /// Classify a relay command topic.
    ///
    /// Returns `Some(Some(channel))` for `<relay>/<channel>/set`,
    /// `Some(None)` for the shared `<relay>/set`, `None` otherwise.
    pub fn parse_relay_command<'a>(&self, topic: &'a str) -> Option<Option<&'a str>> {
        let rest = topic.strip_prefix(self.relay_base())?.strip_prefix('/')?;
        if rest == "set" {
            return Some(None);
        }
        match rest.split_once('/') {
            Some((channel, "set")) if !channel.is_empty() => Some(Some(channel)),
            _ => None,
        }
    }

    /// Discovery config topic: `<prefix>/<component>/<unique_id>/config`.
    pub fn discovery_config(&self, component: &str, unique_id: &str) -> String {
        format!(
            "{}/{component}/{unique_id}/config",
            self.discovery_prefix.trim_end_matches('/')
        )
    }
}

/// MQTT filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
