//! Topic layout shared by the session and the discovery payloads.
//!
//! Channels are numbered from 1 on the broker; index 0 is `relay1`.

use crate::config::DeviceConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
    hostname: String,
    discovery_prefix: String,
}

impl TopicScheme {
    pub fn new(
        prefix: impl Into<String>,
        hostname: impl Into<String>,
        discovery_prefix: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            hostname: hostname.into(),
            discovery_prefix: discovery_prefix.into(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(
            config.topic_prefix.clone(),
            config.hostname.clone(),
            config.discovery_prefix.clone(),
        )
    }

    fn base(&self) -> String {
        format!("{}{}", self.prefix, self.hostname)
    }

    pub fn command_topic(&self, index: usize) -> String {
        format!("{}/relay{}/set", self.base(), index + 1)
    }

    pub fn state_topic(&self, index: usize) -> String {
        format!("{}/relay{}/state", self.base(), index + 1)
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.base())
    }

    pub fn unique_id(&self, index: usize) -> String {
        format!("{}_relay{}", self.hostname, index + 1)
    }

    pub fn discovery_topic(&self, index: usize) -> String {
        format!(
            "{}/switch/{}/config",
            self.discovery_prefix,
            self.unique_id(index)
        )
    }

    /// Resolves a command topic to its channel by exact comparison against
    /// every channel's command topic. The first match wins.
    pub fn channel_for_command(&self, topic: &str, channel_count: usize) -> Option<usize> {
        (0..channel_count).find(|index| self.command_topic(*index) == topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheme() -> TopicScheme {
        TopicScheme::new("homeassistant/switch/", "pi-relay", "homeassistant")
    }

    #[test]
    fn topics_use_one_based_relay_numbers() {
        let s = scheme();
        assert_eq!(s.command_topic(0), "homeassistant/switch/pi-relay/relay1/set");
        assert_eq!(s.state_topic(15), "homeassistant/switch/pi-relay/relay16/state");
        assert_eq!(s.availability_topic(), "homeassistant/switch/pi-relay/availability");
        assert_eq!(
            s.discovery_topic(2),
            "homeassistant/switch/pi-relay_relay3/config"
        );
    }

    #[test]
    fn command_topic_resolution_is_exact() {
        let s = scheme();
        assert_eq!(
            s.channel_for_command("homeassistant/switch/pi-relay/relay3/set", 16),
            Some(2)
        );
        assert_eq!(
            s.channel_for_command("homeassistant/switch/pi-relay/relay1/set", 16),
            Some(0)
        );
        // relay1 must not swallow relay10..relay16
        assert_eq!(
            s.channel_for_command("homeassistant/switch/pi-relay/relay12/set", 16),
            Some(11)
        );
        assert_eq!(
            s.channel_for_command("homeassistant/switch/pi-relay/relay3/state", 16),
            None
        );
        assert_eq!(
            s.channel_for_command("homeassistant/switch/pi-relay/relay17/set", 16),
            None
        );
        assert_eq!(
            s.channel_for_command("homeassistant/switch/other/relay3/set", 16),
            None
        );
    }
}
