use chrono::NaiveDateTime;
use std::fmt;
use tracing::debug;

pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";
pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// A message received on one of the subscribed topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: NaiveDateTime,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.timestamp, self.topic, self.payload_str())
    }
}

/// A message the session hands to the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        OutboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }
}

/// A command topic resolved to its channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelCommand {
    pub index: usize,
    pub value: bool,
}

/// Maps a command payload to a channel state.
///
/// Only the exact payload `ON` switches on. Everything else, including
/// `on`, `1` or garbage, switches off; downstream automations rely on this.
pub fn parse_command_payload(payload: &[u8]) -> bool {
    if payload == PAYLOAD_ON.as_bytes() {
        return true;
    }
    if payload != PAYLOAD_OFF.as_bytes() {
        debug!(
            "Malformed command payload {:?}, treating as OFF",
            String::from_utf8_lossy(payload)
        );
    }
    false
}

pub fn state_payload(on: bool) -> &'static str {
    if on {
        PAYLOAD_ON
    } else {
        PAYLOAD_OFF
    }
}
