//! Device configuration
//!
//! Everything the controller needs to know before it touches hardware or the
//! network: the channel table, naming used on the broker, access point
//! credentials, timeouts and default broker credentials. The file lives next
//! to the persisted state under `~/.config/relaycontroller/` and is written
//! with defaults on first start.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::mqtt::config::BrokerCredentials;

const CONFIG_DIR: &str = ".config/relaycontroller";
const CONFIG_FILE: &str = "config.toml";
const STATE_FILE: &str = "state.toml";

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "RELAYCONTROLLER_CONFIG";

/// Default pin map of the 16-channel board (BCM numbering).
const DEFAULT_PINS: [u8; 16] = [5, 6, 13, 16, 19, 20, 21, 26, 4, 17, 27, 22, 10, 9, 11, 12];

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ChannelDefinition {
    pub pin: u8,
    pub name: String,
}

/// Which output driver backs the relay bank.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// Raspberry Pi GPIO through rppal
    #[default]
    Gpio,
    /// In-memory lines, for running off-target
    Simulated,
}

/// Timing knobs of the connectivity supervisor and the broker session.
///
/// All values are seconds in the file. The poll interval must stay well below
/// the timeouts it enforces or the timeout checks become coarse.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Timings {
    pub poll_interval_ms: u64,
    pub reconnect_timeout_secs: u64,
    pub reconnect_cooldown_secs: u64,
    pub portal_timeout_secs: u64,
    pub broker_retry_secs: u64,
    pub broker_keep_alive_secs: u64,
    pub restart_delay_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            reconnect_timeout_secs: 30,
            reconnect_cooldown_secs: 60,
            portal_timeout_secs: 180,
            broker_retry_secs: 5,
            broker_keep_alive_secs: 15,
            restart_delay_ms: 1000,
        }
    }
}

impl Timings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_secs(self.reconnect_cooldown_secs)
    }

    pub fn portal_timeout(&self) -> Duration {
        Duration::from_secs(self.portal_timeout_secs)
    }

    pub fn broker_retry(&self) -> Duration {
        Duration::from_secs(self.broker_retry_secs)
    }

    pub fn broker_keep_alive(&self) -> Duration {
        Duration::from_secs(self.broker_keep_alive_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Human readable device name, also the discovery device name
    pub device_name: String,
    /// Hostname used in topics, unique ids and name advertisement
    pub hostname: String,
    pub manufacturer: String,
    /// Broker client id; derived from device name and hostname when empty
    pub client_id: String,
    pub ap_ssid: String,
    pub ap_passphrase: String,
    /// Wireless interface managed by the platform adapter
    pub interface: String,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    /// Plain text admin password, compared verbatim
    pub admin_password: String,
    pub output_backend: OutputBackend,
    pub allowed_channel_counts: Vec<usize>,
    pub channels: Vec<ChannelDefinition>,
    pub broker: BrokerCredentials,
    pub timings: Timings,
    /// Persisted state file; defaults to `state.toml` next to the config
    pub state_file: Option<PathBuf>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let channels = DEFAULT_PINS
            .iter()
            .enumerate()
            .map(|(i, pin)| ChannelDefinition {
                pin: *pin,
                name: format!("Relay {}", i + 1),
            })
            .collect();

        Self {
            device_name: "Pi-Relay".to_string(),
            hostname: "pi-relay".to_string(),
            manufacturer: "Raspberry Pi".to_string(),
            client_id: String::new(),
            ap_ssid: "Pi-Relay-Setup".to_string(),
            ap_passphrase: "12345678".to_string(),
            interface: "wlan0".to_string(),
            topic_prefix: "homeassistant/switch/".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            admin_password: "admin".to_string(),
            output_backend: OutputBackend::Gpio,
            allowed_channel_counts: vec![8, 12, 16],
            channels,
            broker: BrokerCredentials::default(),
            timings: Timings::default(),
            state_file: None,
        }
    }
}

impl DeviceConfig {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn client_id(&self) -> String {
        if self.client_id.is_empty() {
            format!("{}-{}", self.device_name, self.hostname)
        } else {
            self.client_id.clone()
        }
    }

    pub fn model(&self) -> String {
        format!("{}-Channel Relay Controller", self.channel_count())
    }

    /// Whether `count` may be chosen as the active channel count.
    pub fn is_allowed_channel_count(&self, count: usize) -> bool {
        count >= 1
            && count <= self.channel_count()
            && self.allowed_channel_counts.contains(&count)
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| config_dir().join(STATE_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(eyre!("Channel table is empty"));
        }

        let mut pins = HashSet::new();
        for channel in &self.channels {
            if !pins.insert(channel.pin) {
                return Err(eyre!("Pin {} is assigned to more than one channel", channel.pin));
            }
        }

        if let Some(count) = self
            .allowed_channel_counts
            .iter()
            .find(|c| **c == 0 || **c > self.channel_count())
        {
            return Err(eyre!(
                "Allowed channel count {} outside 1..={}",
                count,
                self.channel_count()
            ));
        }

        if self.hostname.is_empty() {
            return Err(eyre!("Hostname must not be empty"));
        }

        let t = &self.timings;
        if t.poll_interval_ms == 0
            || t.reconnect_timeout_secs == 0
            || t.portal_timeout_secs == 0
            || t.broker_retry_secs == 0
        {
            return Err(eyre!("Timings must be non-zero"));
        }
        if t.poll_interval() >= t.reconnect_timeout() {
            warn!(
                "Poll interval {:?} is not shorter than the reconnect timeout {:?}",
                t.poll_interval(),
                t.reconnect_timeout()
            );
        }

        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

        let config: DeviceConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;

        Ok(())
    }

    /// Loads the config at `path`, writing the defaults there first if the
    /// file does not exist yet.
    pub async fn ensure_and_load(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?;

        if !exists {
            info!("Creating default configuration at {}", path.display());
            DeviceConfig::default().save(path).await?;
        }

        Self::load(path).await
    }
}

/// Config file location, honouring [`CONFIG_ENV`].
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => PathBuf::from(path),
        None => config_dir().join(CONFIG_FILE),
    }
}

fn config_dir() -> PathBuf {
    let mut base_path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    base_path.push(CONFIG_DIR);
    base_path
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_count(), 16);
        assert_eq!(config.channels[2].name, "Relay 3");
    }

    #[test]
    fn allowed_counts_respect_channel_table() {
        let mut config = DeviceConfig::default();
        assert!(config.is_allowed_channel_count(8));
        assert!(config.is_allowed_channel_count(16));
        assert!(!config.is_allowed_channel_count(10));
        assert!(!config.is_allowed_channel_count(0));

        config.channels.truncate(12);
        assert!(!config.is_allowed_channel_count(16));
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_pins_are_rejected() {
        let mut config = DeviceConfig::default();
        config.channels[1].pin = config.channels[0].pin;
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_id_falls_back_to_names() {
        let mut config = DeviceConfig::default();
        assert_eq!(config.client_id(), "Pi-Relay-pi-relay");
        config.client_id = "custom".to_string();
        assert_eq!(config.client_id(), "custom");
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = DeviceConfig::ensure_and_load(&path).await.unwrap();
        assert_eq!(config, DeviceConfig::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "hostname = \"garage\"\n[timings]\nreconnect_timeout_secs = 10\n")
            .await
            .unwrap();

        let config = DeviceConfig::load(&path).await.unwrap();
        assert_eq!(config.hostname, "garage");
        assert_eq!(config.timings.reconnect_timeout_secs, 10);
        assert_eq!(config.timings.reconnect_cooldown_secs, 60);
        assert_eq!(config.channel_count(), 16);
    }
}
