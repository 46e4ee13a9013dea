//! # Control Surface
//!
//! The API a local web or admin frontend drives. Requests are sent as
//! [`ControlAction`]s to the control loop, which owns every component, and
//! answered over a oneshot channel. [`control_handle::ControlHandle`] wraps
//! that exchange in async methods and can be cloned freely.
//!
//! Admin changes that only take effect at boot (active channel count, broker
//! credentials, network reset) are persisted first and then schedule a
//! process restart.

pub mod control_handle;

pub use control_handle::ControlHandle;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::connectivity::ConnectivitySnapshot;
use crate::context::ContextError;
use crate::mqtt::mqtt_handler::ConnectionState;
use crate::relay::{ChannelSnapshot, RelayError};
use crate::synchronizer::{ApplyReport, BulkReport};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Channel count {0} is not one of the allowed counts")]
    InvalidChannelCount(usize),

    #[error("Invalid broker settings: {0}")]
    InvalidBrokerSettings(String),

    #[error("Network request failed: {0}")]
    Network(String),

    #[error("Storage write failed: {0}")]
    Storage(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("Control loop is not running")]
    ChannelClosed,

    #[error("Control loop dropped the request")]
    ResponseDropped,
}

/// Admin view of the runtime settings. The broker password never leaves
/// the device; a non-empty one is shown as a mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminConfig {
    pub active_channels: usize,
    pub total_channels: usize,
    pub allowed_channel_counts: Vec<usize>,
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_user: String,
    pub broker_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStatus {
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub connection_state: ConnectionState,
    pub connect_attempts: usize,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_error: Option<String>,
    /// RFC 3339, local time
    pub last_activity: Option<String>,
}

/// New broker settings as submitted by the admin form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettingsUpdate {
    pub host: String,
    /// Unchecked; validated against 1..=65535
    pub port: u32,
    pub username: String,
    /// The password mask keeps the stored password
    pub password: String,
}

pub type Responder<T> = oneshot::Sender<T>;

#[derive(Debug)]
pub enum ControlAction {
    ChannelSnapshot {
        response_tx: Responder<Vec<ChannelSnapshot>>,
    },
    ApplyCommand {
        index: usize,
        value: bool,
        response_tx: Responder<Result<ApplyReport, ControlError>>,
    },
    Toggle {
        index: usize,
        response_tx: Responder<Result<ApplyReport, ControlError>>,
    },
    SetAll {
        value: bool,
        response_tx: Responder<BulkReport>,
    },
    ConnectivitySnapshot {
        response_tx: Responder<ConnectivitySnapshot>,
    },
    SetActiveChannelCount {
        count: usize,
        response_tx: Responder<Result<(), ControlError>>,
    },
    AdminConfig {
        response_tx: Responder<Result<AdminConfig, ControlError>>,
    },
    SetBrokerSettings {
        update: BrokerSettingsUpdate,
        response_tx: Responder<Result<(), ControlError>>,
    },
    BrokerStatus {
        response_tx: Responder<BrokerStatus>,
    },
    ReconfigureStation {
        ssid: String,
        password: String,
        response_tx: Responder<Result<(), ControlError>>,
    },
    ResetNetwork {
        response_tx: Responder<Result<(), ControlError>>,
    },
    Restart {
        response_tx: Responder<Result<(), ControlError>>,
    },
}
