use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::platform::{NetworkEvent, NetworkPlatform, PlatformError, RadioMode};
use super::{ConnectivitySnapshot, ConnectivityState};
use crate::config::DeviceConfig;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("SSID must not be empty")]
    MissingSsid,

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisorTimings {
    pub reconnect_timeout: Duration,
    pub reconnect_cooldown: Duration,
    pub portal_timeout: Duration,
}

impl SupervisorTimings {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            reconnect_timeout: config.timings.reconnect_timeout(),
            reconnect_cooldown: config.timings.reconnect_cooldown(),
            portal_timeout: config.timings.portal_timeout(),
        }
    }
}

/// Owns [`ConnectivityState`] and drives the radio through a
/// [`NetworkPlatform`].
///
/// Transitions happen in two places only: [`handle_event`] for link
/// signals and [`poll`] for everything time based. Both take the current
/// time from the caller.
///
/// [`handle_event`]: ConnectivitySupervisor::handle_event
/// [`poll`]: ConnectivitySupervisor::poll
pub struct ConnectivitySupervisor<P: NetworkPlatform> {
    platform: P,
    state: ConnectivityState,
    timings: SupervisorTimings,
    hostname: String,
    ap_ssid: String,
    ap_passphrase: String,
    /// Start of the running station attempt
    attempt_started: Option<Instant>,
    /// Last attempt, or last poll that deferred one because of AP clients
    last_attempt: Option<Instant>,
    ap_active: bool,
    ap_address: Option<Ipv4Addr>,
    address: Option<Ipv4Addr>,
    /// Network of the last station attempt or link
    station_ssid: Option<String>,
}

impl<P: NetworkPlatform> ConnectivitySupervisor<P> {
    pub fn new(
        platform: P,
        timings: SupervisorTimings,
        hostname: impl Into<String>,
        ap_ssid: impl Into<String>,
        ap_passphrase: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            state: ConnectivityState::Connecting,
            timings,
            hostname: hostname.into(),
            ap_ssid: ap_ssid.into(),
            ap_passphrase: ap_passphrase.into(),
            attempt_started: None,
            last_attempt: None,
            ap_active: false,
            ap_address: None,
            address: None,
            station_ssid: None,
        }
    }

    pub fn from_config(platform: P, config: &DeviceConfig) -> Self {
        Self::new(
            platform,
            SupervisorTimings::from_config(config),
            config.hostname.clone(),
            config.ap_ssid.clone(),
            config.ap_passphrase.clone(),
        )
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn timings(&self) -> SupervisorTimings {
        self.timings
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Applies a link signal. Signals are never deferred to the next poll.
    pub fn handle_event(&mut self, event: NetworkEvent) -> ConnectivityState {
        match event {
            NetworkEvent::LinkUp { address } => self.on_link_up(address),
            NetworkEvent::LinkDown => {
                if self.state == ConnectivityState::Connected {
                    warn!("Station link lost");
                    self.state = ConnectivityState::Disconnected;
                    self.address = None;
                } else {
                    debug!("Ignoring link loss in state {:?}", self.state);
                }
            }
        }
        self.state
    }

    fn on_link_up(&mut self, address: Ipv4Addr) {
        if self.state == ConnectivityState::Connected && self.address == Some(address) {
            return;
        }

        info!("Station connected, address {}", address);
        self.state = ConnectivityState::Connected;
        self.attempt_started = None;
        self.address = Some(address);

        if self.ap_active {
            match self.platform.set_mode(RadioMode::Station) {
                Ok(()) => {
                    info!("Access point disabled, station mode only");
                    self.ap_active = false;
                    self.ap_address = None;
                }
                Err(e) => warn!("Failed to leave access point mode: {}", e),
            }
        }

        self.advertise(address);
        if let Some(info) = self.platform.station_info() {
            self.station_ssid = Some(info.ssid);
        }
    }

    /// Runs the time based transitions.
    pub fn poll(&mut self, now: Instant) -> ConnectivityState {
        match self.state {
            ConnectivityState::Connected => {}
            ConnectivityState::Disconnected => {
                info!("Reconnecting to station network");
                self.begin_attempt(now);
                self.state = ConnectivityState::Connecting;
            }
            ConnectivityState::Connecting => {
                if self.attempt_expired(now) {
                    warn!(
                        "No station link after {:?}, starting access point",
                        self.timings.reconnect_timeout
                    );
                    self.enter_fallback(now);
                }
            }
            ConnectivityState::ApFallback => {
                let clients = self.platform.access_point_clients();
                if clients > 0 {
                    debug!("{} access point clients attached, deferring reconnect", clients);
                    self.last_attempt = Some(now);
                } else if self.cooldown_elapsed(now) {
                    info!("Access point idle, retrying station network in background");
                    self.begin_attempt(now);
                    self.state = ConnectivityState::ApReconnecting;
                }
            }
            ConnectivityState::ApReconnecting => {
                if self.attempt_expired(now) {
                    debug!("Background station attempt timed out");
                    self.enter_fallback(now);
                }
            }
        }
        self.state
    }

    fn attempt_expired(&self, now: Instant) -> bool {
        match self.attempt_started {
            Some(started) => now.duration_since(started) >= self.timings.reconnect_timeout,
            None => true,
        }
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(last) => now.duration_since(last) >= self.timings.reconnect_cooldown,
            None => true,
        }
    }

    fn begin_attempt(&mut self, now: Instant) {
        self.attempt_started = Some(now);
        self.last_attempt = Some(now);
        if let Err(e) = self.platform.begin_station() {
            warn!("Station attempt could not be started: {}", e);
        }
    }

    fn enter_fallback(&mut self, now: Instant) {
        self.state = ConnectivityState::ApFallback;
        self.attempt_started = None;
        self.last_attempt = Some(now);

        // attached clients stay attached across background attempts
        if self.ap_active {
            debug!("Access point already up, keeping it");
            return;
        }

        if let Err(e) = self.platform.set_mode(RadioMode::AccessPointStation) {
            warn!("Failed to enable access point mode: {}", e);
        }

        match self
            .platform
            .start_access_point(&self.ap_ssid, &self.ap_passphrase)
        {
            Ok(address) => {
                self.ap_active = true;
                self.ap_address = address;
                info!(
                    "Access point {} up at {}",
                    self.ap_ssid,
                    address.map_or_else(|| "unknown address".to_string(), |a| a.to_string())
                );
                if let Some(address) = address {
                    self.advertise(address);
                }
            }
            Err(e) => warn!("Failed to start access point: {}", e),
        }
    }

    fn advertise(&mut self, address: Ipv4Addr) {
        match self.platform.restart_advertisement(&self.hostname, address) {
            Ok(()) => info!("Advertising {}.local at {}", self.hostname, address),
            Err(e) => warn!("Name advertisement failed: {}", e),
        }
    }

    /// Starts a non-blocking attempt with new station credentials.
    pub fn reconfigure_station(
        &mut self,
        ssid: &str,
        password: &str,
        now: Instant,
    ) -> Result<(), SupervisorError> {
        if ssid.is_empty() {
            return Err(SupervisorError::MissingSsid);
        }

        info!("Joining station network {}", ssid);
        self.platform.join(ssid, password)?;
        self.station_ssid = Some(ssid.to_string());
        self.attempt_started = Some(now);
        self.last_attempt = Some(now);
        self.state = match self.state {
            ConnectivityState::Connected => ConnectivityState::Connected,
            ConnectivityState::ApFallback | ConnectivityState::ApReconnecting => {
                ConnectivityState::ApReconnecting
            }
            ConnectivityState::Disconnected | ConnectivityState::Connecting => {
                ConnectivityState::Connecting
            }
        };
        Ok(())
    }

    /// Forgets the saved station credentials. Takes effect after a restart.
    pub fn reset_network(&mut self) -> Result<(), SupervisorError> {
        self.platform.forget_station()?;
        info!("Saved station credentials removed");
        Ok(())
    }

    pub fn snapshot(&mut self) -> ConnectivitySnapshot {
        let connected = self.state == ConnectivityState::Connected;
        let station = if connected {
            self.platform.station_info()
        } else {
            None
        };
        if let Some(info) = &station {
            self.station_ssid = Some(info.ssid.clone());
        }
        let ap_clients = if self.ap_active {
            Some(self.platform.access_point_clients())
        } else {
            None
        };

        ConnectivitySnapshot {
            state: self.state,
            connected,
            ap_mode_active: self.ap_active,
            ssid: self.station_ssid.clone(),
            ip: station.as_ref().and_then(|s| s.ip).or(self.address),
            rssi: station.and_then(|s| s.rssi),
            ap_ssid: self.ap_active.then(|| self.ap_ssid.clone()),
            ap_ip: self.ap_address.filter(|_| self.ap_active),
            ap_clients,
        }
    }

    /// Starts the one-time boot attempt with the saved station credentials.
    pub fn begin_bootstrap(&mut self, now: Instant) {
        info!("Connecting to saved station network");
        self.state = ConnectivityState::Connecting;
        self.begin_attempt(now);
    }

    /// Opens the configuration portal after the boot attempt failed.
    pub fn open_portal(&mut self, now: Instant) {
        warn!(
            "Saved network unreachable, configuration portal open for {:?}",
            self.timings.portal_timeout
        );
        self.enter_fallback(now);
    }
}
