//! # Persistence Module
//!
//! ## Why This Module Exists
//! The controller has to come back from a power cut or a forced restart in the
//! state it was left in. This module is the only durable owner of:
//! - the last known state of every relay channel
//! - the active channel count (how many channels are advertised)
//! - the broker credentials, when they were overridden at runtime
//!
//! ## Key Abstractions
//! - **Flat key/value table**: one key per fact (`relay0`, `active_count`,
//!   `mqtt_server`, ...), stored as a TOML document
//! - **Read once, write on mutation**: the table is loaded at boot; every
//!   confirmed mutation rewrites the whole table
//! - **Pluggable backends**: file backed in production, in-memory for tests
//!
//! ## Error Handling Strategy
//! Write failures are returned as [`store::StoreError`] and treated as
//! recoverable by callers: they log and carry on. Because every write is a
//! full rewrite, the next successful write repairs any staleness. Missing or
//! unreadable keys fall back to defaults instead of preventing startup.

pub mod store;

use crate::mqtt::config::BrokerCredentials;

pub const RELAY_KEY_PREFIX: &str = "relay";
pub const ACTIVE_COUNT_KEY: &str = "active_count";
pub const BROKER_HOST_KEY: &str = "mqtt_server";
pub const BROKER_PORT_KEY: &str = "mqtt_port";
pub const BROKER_USER_KEY: &str = "mqtt_user";
pub const BROKER_PASSWORD_KEY: &str = "mqtt_pass";

pub fn relay_key(index: usize) -> String {
    format!("{}{}", RELAY_KEY_PREFIX, index)
}

/// Everything restored at boot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedState {
    /// One entry per configured channel; absent keys read as OFF
    pub channel_states: Vec<bool>,
    /// Active channel count, already checked against the allowed set
    pub active_channel_count: usize,
    /// Stored credentials, or the configured defaults
    pub broker: BrokerCredentials,
}
