//! # Connectivity Module
//!
//! Keeps the device reachable. The supervisor tries the saved station
//! network first and falls back to hosting its own access point when that
//! does not work, so the device can always be configured locally.
//!
//! ```text
//!            LinkUp                       LinkDown
//! Connecting ───────► Connected ─────────────────► Disconnected
//!    ▲  │                ▲  ▲                            │
//!    │  │ timeout        │  └──── LinkUp ─────┐          │ poll
//!    │  ▼                │                    │          │
//!    │ ApFallback ───────┘ LinkUp      ApReconnecting    │
//!    │     │  ▲                               ▲  │       │
//!    │     │  └──────── timeout ──────────────┼──┘       │
//!    │     └─── no clients + cooldown ────────┘          │
//!    └───────────────────────────────────────────────────┘
//! ```
//!
//! Link signals come from [`link_monitor`] through a bounded channel and are
//! applied by the control loop as they arrive; everything time based happens
//! in [`supervisor::ConnectivitySupervisor::poll`].

pub mod link_monitor;
pub mod nmcli;
pub mod platform;
pub mod supervisor;

pub use platform::{NetworkEvent, NetworkPlatform, PlatformError, RadioMode, StationInfo};
pub use supervisor::{ConnectivitySupervisor, SupervisorError, SupervisorTimings};

use serde::Serialize;
use std::net::Ipv4Addr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ConnectivityState {
    Disconnected,
    #[default]
    Connecting,
    Connected,
    ApFallback,
    ApReconnecting,
}

/// What the control surface shows about the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectivitySnapshot {
    pub state: ConnectivityState,
    pub connected: bool,
    pub ap_mode_active: bool,
    pub ssid: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub rssi: Option<i32>,
    /// The access point fields are only reported while it is up
    pub ap_ssid: Option<String>,
    pub ap_ip: Option<Ipv4Addr>,
    pub ap_clients: Option<usize>,
}
