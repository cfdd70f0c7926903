//! Home Assistant MQTT discovery descriptors.

use serde::{Deserialize, Serialize};

use crate::topics::TopicSet;

/// Entity platform in the discovery topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Sensor,
    Switch,
}

impl ComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Sensor => "sensor",
            ComponentType::Switch => "switch",
        }
    }
}

/// The physical device every entity is grouped under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub sw_version: String,
}

/// Retained config payload for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDescriptor {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    pub availability_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_attributes_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
    pub device: DeviceDescriptor,
}

/// A descriptor paired with the topic it is retained on.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryEntry {
    pub component: ComponentType,
    pub topic: String,
    pub descriptor: DiscoveryDescriptor,
}

/// Unique id for a channel entity: `<node_id>_<channel>`.
pub fn unique_id(node_id: &str, channel: &str) -> String {
    format!("{node_id}_{channel}")
}

/// Power sensor for one PZEM channel. The remaining readings arrive as
/// JSON attributes from the same state topic.
pub fn sensor_entry(
    topics: &TopicSet,
    device: &DeviceDescriptor,
    node_id: &str,
    channel: &str,
    state_topic: &str,
) -> DiscoveryEntry {
    let unique_id = unique_id(node_id, channel);
    DiscoveryEntry {
        component: ComponentType::Sensor,
        topic: topics.discovery_config(ComponentType::Sensor.as_str(), &unique_id),
        descriptor: DiscoveryDescriptor {
            name: format!("{} {channel} power", device.name),
            unique_id,
            state_topic: state_topic.to_string(),
            command_topic: None,
            availability_topic: topics.availability.clone(),
            device_class: Some("power".into()),
            unit_of_measurement: Some("W".into()),
            state_class: Some("measurement".into()),
            value_template: Some("{{ value_json.power }}".into()),
            json_attributes_topic: Some(state_topic.to_string()),
            payload_on: None,
            payload_off: None,
            device: device.clone(),
        },
    }
}

/// Switch entity for one relay channel.
pub fn relay_entry(
    topics: &TopicSet,
    device: &DeviceDescriptor,
    node_id: &str,
    channel: &str,
) -> DiscoveryEntry {
    let unique_id = unique_id(node_id, channel);
    DiscoveryEntry {
        component: ComponentType::Switch,
        topic: topics.discovery_config(ComponentType::Switch.as_str(), &unique_id),
        descriptor: DiscoveryDescriptor {
            name: format!("{} {channel}", device.name),
            unique_id,
            state_topic: topics.relay_state(channel),
            command_topic: Some(topics.relay_command(channel)),
            availability_topic: topics.availability.clone(),
            device_class: Some("outlet".into()),
            unit_of_measurement: None,
            state_class: None,
            value_template: None,
            json_attributes_topic: None,
            payload_on: Some("ON".into()),
            payload_off: Some("OFF".into()),
            device: device.clone(),
        },
    }
}
