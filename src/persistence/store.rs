use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::{
    relay_key, PersistedState, ACTIVE_COUNT_KEY, BROKER_HOST_KEY, BROKER_PASSWORD_KEY,
    BROKER_PORT_KEY, BROKER_USER_KEY,
};
use crate::config::DeviceConfig;
use crate::mqtt::config::BrokerCredentials;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode state table: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("Failed to decode state table: {0}")]
    Decode(#[from] toml::de::Error),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

pub type StateTable = BTreeMap<String, StoredValue>;

/// Durable medium behind [`PersistentStore`].
pub trait StoreBackend {
    fn load(&self) -> Result<StateTable, StoreError>;

    /// Replaces the stored table with `table`.
    fn commit(&mut self, table: &StateTable) -> Result<(), StoreError>;
}

/// TOML file, replaced atomically through a sibling temp file.
pub struct TomlFileBackend {
    path: PathBuf,
}

impl TomlFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StoreBackend for TomlFileBackend {
    fn load(&self) -> Result<StateTable, StoreError> {
        if !self.path.exists() {
            debug!("No state file at {}, starting empty", self.path.display());
            return Ok(StateTable::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        Ok(toml::from_str(&content)?)
    }

    fn commit(&mut self, table: &StateTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let content = toml::to_string(table)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;
        Ok(())
    }
}

/// Typed access to the persisted key/value table.
///
/// The table is read from the backend once, when the store is opened. Every
/// save updates the in-memory table first and then commits all of it, so a
/// failed commit is repaired by the next successful one.
pub struct PersistentStore {
    backend: Box<dyn StoreBackend>,
    table: StateTable,
}

impl PersistentStore {
    pub fn open(backend: Box<dyn StoreBackend>) -> Result<Self, StoreError> {
        let table = backend.load()?;
        debug!("Opened state store with {} keys", table.len());
        Ok(Self { backend, table })
    }

    /// Opens the store, falling back to an empty table if the stored one
    /// cannot be read. The next commit overwrites the unreadable data.
    pub fn open_or_empty(backend: Box<dyn StoreBackend>) -> Self {
        match backend.load() {
            Ok(table) => Self { backend, table },
            Err(e) => {
                warn!("Stored state unreadable, starting from defaults: {}", e);
                Self {
                    backend,
                    table: StateTable::new(),
                }
            }
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.table.get(key) {
            Some(StoredValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.table.get(key) {
            Some(StoredValue::Int(v)) => Some(*v),
            Some(StoredValue::Text(s)) => s.parse().ok(),
            _ => None,
        }
    }

    fn get_text(&self, key: &str) -> Option<&str> {
        match self.table.get(key) {
            Some(StoredValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.backend.commit(&self.table)
    }

    pub fn channel_states(&self, count: usize) -> Vec<bool> {
        (0..count)
            .map(|i| self.get_bool(&relay_key(i)).unwrap_or(false))
            .collect()
    }

    /// Rewrites the state of every channel.
    pub fn save_channel_states(&mut self, states: &[bool]) -> Result<(), StoreError> {
        for (i, state) in states.iter().enumerate() {
            self.table.insert(relay_key(i), StoredValue::Bool(*state));
        }
        self.commit()?;
        debug!("Relay states saved");
        Ok(())
    }

    pub fn active_channel_count(&self) -> Option<usize> {
        self.get_int(ACTIVE_COUNT_KEY)
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn save_active_channel_count(&mut self, count: usize) -> Result<(), StoreError> {
        let value = i64::try_from(count)
            .map_err(|_| StoreError::Unavailable(format!("count {} out of range", count)))?;
        self.table
            .insert(ACTIVE_COUNT_KEY.to_string(), StoredValue::Int(value));
        self.commit()
    }

    /// Stored credentials if a broker host was ever saved, `defaults` otherwise.
    pub fn broker_credentials(&self, defaults: &BrokerCredentials) -> BrokerCredentials {
        match self.get_text(BROKER_HOST_KEY) {
            Some(host) if !host.is_empty() => BrokerCredentials {
                host: host.to_string(),
                port: self
                    .get_int(BROKER_PORT_KEY)
                    .and_then(|p| u16::try_from(p).ok())
                    .filter(|p| *p != 0)
                    .unwrap_or(defaults.port),
                username: self.get_text(BROKER_USER_KEY).unwrap_or_default().to_string(),
                password: self
                    .get_text(BROKER_PASSWORD_KEY)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => defaults.clone(),
        }
    }

    pub fn save_broker_credentials(&mut self, creds: &BrokerCredentials) -> Result<(), StoreError> {
        self.table
            .insert(BROKER_HOST_KEY.to_string(), StoredValue::Text(creds.host.clone()));
        self.table
            .insert(BROKER_PORT_KEY.to_string(), StoredValue::Int(i64::from(creds.port)));
        self.table
            .insert(BROKER_USER_KEY.to_string(), StoredValue::Text(creds.username.clone()));
        self.table.insert(
            BROKER_PASSWORD_KEY.to_string(),
            StoredValue::Text(creds.password.clone()),
        );
        self.commit()
    }

    /// Reads everything the controller restores at boot, validating the
    /// active channel count against the configuration.
    pub fn restore(&self, config: &DeviceConfig) -> PersistedState {
        let total = config.channel_count();
        let active_channel_count = match self.active_channel_count() {
            None => total,
            Some(count) if config.is_allowed_channel_count(count) => count,
            Some(count) => {
                warn!(
                    "Stored active channel count {} is not allowed, using {}",
                    count, total
                );
                total
            }
        };

        let broker = self.broker_credentials(&config.broker);
        if broker == config.broker {
            info!("Using configured broker settings");
        } else {
            info!("Broker settings loaded from storage");
        }

        PersistedState {
            channel_states: self.channel_states(total),
            active_channel_count,
            broker,
        }
    }
}
