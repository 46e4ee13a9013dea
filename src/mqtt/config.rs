use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shown instead of the stored password; submitting it back keeps the old one.
pub const PASSWORD_MASK: &str = "••••••••";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for BrokerCredentials {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl BrokerCredentials {
    pub fn has_username(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Everything a transport needs to open one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub credentials: BrokerCredentials,
    pub keep_alive: Duration,
    pub will_topic: String,
    pub will_payload: String,
    pub will_retain: bool,
}
