//! Home Assistant discovery announcer.
//!
//! One retained config message per meter channel and relay channel. The
//! entries go through `Session::ensure_retained`, so announcing twice in
//! the same session is a no-op and the session replays them after every
//! reconnect.

use pz_mqtt_channel::{Session, SessionError, SessionResult};
use pz_protocol::discovery::{relay_entry, sensor_entry};
use pz_protocol::{DeviceDescriptor, DiscoveryEntry, TopicSet};

use crate::config::AgentConfig;

pub struct DiscoveryAnnouncer {
    entries: Vec<DiscoveryEntry>,
}

impl DiscoveryAnnouncer {
    pub fn new(topics: &TopicSet, device: &DeviceDescriptor, node_id: &str, relays: &[String]) -> Self {
        let sensors = topics
            .sensors
            .iter()
            .map(|(channel, topic)| sensor_entry(topics, device, node_id, channel, topic));
        let switches = relays
            .iter()
            .map(|channel| relay_entry(topics, device, node_id, channel));
        Self {
            entries: sensors.chain(switches).collect(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            &config.topics,
            &config.device_descriptor(),
            &config.node_id(),
            &config.relays,
        )
    }

    pub fn entries(&self) -> &[DiscoveryEntry] {
        &self.entries
    }

    /// Retain every descriptor. Returns how many were actually published.
    pub async fn announce_all(&self, session: &Session) -> SessionResult<usize> {
        let mut published = 0;
        for entry in &self.entries {
            let payload = serde_json::to_vec(&entry.descriptor)
                .map_err(|e| SessionError::Serialization(e.to_string()))?;
            if session.ensure_retained(&entry.topic, &payload).await? {
                published += 1;
            }
        }
        if published > 0 {
            tracing::info!(published, total = self.entries.len(), "discovery announced");
        } else {
            tracing::debug!("discovery already current");
        }
        Ok(published)
    }
}
