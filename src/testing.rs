//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::config::DeviceConfig;
use crate::connectivity::{NetworkPlatform, PlatformError, RadioMode, StationInfo};
use crate::mqtt::config::SessionOptions;
use crate::mqtt::message_manager::OutboundMessage;
use crate::mqtt::transport::{BrokerError, BrokerTransport, TransportEvent};
use crate::persistence::store::{StateTable, StoreBackend, StoreError};
use crate::relay::output::{SimulatedDriver, WriteLog};
use crate::relay::{ChannelSnapshot, Ready, RelayBank};
use crate::synchronizer::StatePublisher;

pub fn simulated_bank(config: &DeviceConfig) -> (RelayBank<Ready>, WriteLog) {
    let driver = SimulatedDriver::new();
    let log = driver.write_log();
    let bank = RelayBank::create(&config.channels, Box::new(driver))
        .claim()
        .expect("simulated lines always claim");
    (bank, log)
}

/// Snapshots of the default channel table, with the listed channels ON.
pub fn channel_snapshots(count: usize, on: &[usize]) -> Vec<ChannelSnapshot> {
    let config = DeviceConfig::default();
    config
        .channels
        .iter()
        .take(count)
        .enumerate()
        .map(|(index, def)| ChannelSnapshot {
            index,
            name: def.name.clone(),
            state: on.contains(&index),
            pin: def.pin,
        })
        .collect()
}

#[derive(Default)]
struct MemoryInner {
    table: StateTable,
    commits: usize,
    fail: bool,
}

/// Shared in-memory store backend; clones see the same table, which is how
/// tests simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    pub fn table(&self) -> StateTable {
        self.inner.lock().unwrap().table.clone()
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&self) -> Result<StateTable, StoreError> {
        Ok(self.inner.lock().unwrap().table.clone())
    }

    fn commit(&mut self, table: &StateTable) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(StoreError::Unavailable("simulated write failure".to_string()));
        }
        inner.table = table.clone();
        inner.commits += 1;
        Ok(())
    }
}

/// Broker transport that records everything and replays queued events.
#[derive(Default)]
pub struct RecordingTransport {
    pub opens: usize,
    pub closes: usize,
    pub fail_open: bool,
    pub last_options: Option<SessionOptions>,
    pub published: Vec<OutboundMessage>,
    pub subscriptions: Vec<String>,
    pub pending: VecDeque<TransportEvent>,
}

impl RecordingTransport {
    pub fn push(&mut self, event: TransportEvent) {
        self.pending.push_back(event);
    }

    pub fn published_with_suffix(&self, suffix: &str) -> Vec<&OutboundMessage> {
        self.published
            .iter()
            .filter(|m| m.topic.ends_with(suffix))
            .collect()
    }
}

impl BrokerTransport for RecordingTransport {
    fn open(&mut self, options: &SessionOptions) -> Result<(), BrokerError> {
        self.opens += 1;
        self.last_options = Some(options.clone());
        if self.fail_open {
            return Err(BrokerError::Connect("refused".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closes += 1;
    }

    fn next_event(&mut self) -> Option<TransportEvent> {
        self.pending.pop_front()
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), BrokerError> {
        self.published.push(message.clone());
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }
}

pub struct RecordingPublisher {
    pub connected: bool,
    pub published: Vec<(usize, bool)>,
}

impl RecordingPublisher {
    pub fn connected() -> Self {
        Self {
            connected: true,
            published: Vec::new(),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            published: Vec::new(),
        }
    }
}

impl StatePublisher for RecordingPublisher {
    fn publish_state(&mut self, index: usize, state: bool) -> bool {
        if self.connected {
            self.published.push((index, state));
        }
        self.connected
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformCall {
    BeginStation,
    Join(String),
    ForgetStation,
    SetMode(RadioMode),
    StartAccessPoint(String),
    Advertise(String, Ipv4Addr),
}

/// Network platform that records calls. Station attempts never succeed on
/// their own; tests deliver link events explicitly.
pub struct FakePlatform {
    pub calls: Vec<PlatformCall>,
    pub clients: usize,
    pub ap_address: Ipv4Addr,
}

impl FakePlatform {
    pub fn new(ap_address: Ipv4Addr) -> Self {
        Self {
            calls: Vec::new(),
            clients: 0,
            ap_address,
        }
    }

    pub fn ap_started(&self) -> bool {
        self.calls
            .iter()
            .any(|c| matches!(c, PlatformCall::StartAccessPoint(_)))
    }

    pub fn station_attempts(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, PlatformCall::BeginStation | PlatformCall::Join(_)))
            .count()
    }
}

impl NetworkPlatform for FakePlatform {
    fn begin_station(&mut self) -> Result<(), PlatformError> {
        self.calls.push(PlatformCall::BeginStation);
        Ok(())
    }

    fn join(&mut self, ssid: &str, _password: &str) -> Result<(), PlatformError> {
        self.calls.push(PlatformCall::Join(ssid.to_string()));
        Ok(())
    }

    fn forget_station(&mut self) -> Result<(), PlatformError> {
        self.calls.push(PlatformCall::ForgetStation);
        Ok(())
    }

    fn set_mode(&mut self, mode: RadioMode) -> Result<(), PlatformError> {
        self.calls.push(PlatformCall::SetMode(mode));
        Ok(())
    }

    fn start_access_point(
        &mut self,
        ssid: &str,
        _passphrase: &str,
    ) -> Result<Option<Ipv4Addr>, PlatformError> {
        self.calls.push(PlatformCall::StartAccessPoint(ssid.to_string()));
        Ok(Some(self.ap_address))
    }

    fn access_point_clients(&mut self) -> usize {
        self.clients
    }

    fn station_info(&mut self) -> Option<StationInfo> {
        Some(StationInfo {
            ssid: "test-net".to_string(),
            ip: None,
            rssi: Some(-55),
        })
    }

    fn restart_advertisement(
        &mut self,
        hostname: &str,
        address: Ipv4Addr,
    ) -> Result<(), PlatformError> {
        self.calls
            .push(PlatformCall::Advertise(hostname.to_string(), address));
        Ok(())
    }
}
