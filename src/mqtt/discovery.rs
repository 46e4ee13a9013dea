//! Home Assistant MQTT discovery payloads.
//!
//! One retained `switch` config per active channel. The device block is the
//! same for every channel so the hub groups them under one device.

use serde::Serialize;

use super::message_manager::{OutboundMessage, PAYLOAD_OFF, PAYLOAD_ON};
use super::topics::TopicScheme;
use crate::config::DeviceConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SWITCH_ICON: &str = "mdi:electric-switch";

/// Device metadata shared by all discovery payloads.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
}

impl DeviceInfo {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            identifiers: vec![config.hostname.clone()],
            name: config.device_name.clone(),
            manufacturer: config.manufacturer.clone(),
            model: config.model(),
            sw_version: VERSION.to_string(),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SwitchDiscovery {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    pub command_topic: String,
    pub availability_topic: String,
    pub payload_on: &'static str,
    pub payload_off: &'static str,
    pub state_on: &'static str,
    pub state_off: &'static str,
    pub optimistic: bool,
    pub icon: &'static str,
    pub device: DeviceInfo,
}

impl SwitchDiscovery {
    pub fn new(topics: &TopicScheme, index: usize, name: &str, device: &DeviceInfo) -> Self {
        Self {
            name: name.to_string(),
            unique_id: topics.unique_id(index),
            state_topic: topics.state_topic(index),
            command_topic: topics.command_topic(index),
            availability_topic: topics.availability_topic(),
            payload_on: PAYLOAD_ON,
            payload_off: PAYLOAD_OFF,
            state_on: PAYLOAD_ON,
            state_off: PAYLOAD_OFF,
            optimistic: false,
            icon: SWITCH_ICON,
            device: device.clone(),
        }
    }

    pub fn into_message(self, topics: &TopicScheme, index: usize) -> serde_json::Result<OutboundMessage> {
        let body = serde_json::to_string(&self)?;
        Ok(OutboundMessage::retained(topics.discovery_topic(index), body))
    }
}
