use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::config::{BrokerCredentials, SessionOptions};
use super::discovery::{DeviceInfo, SwitchDiscovery};
use super::message_manager::{
    parse_command_payload, state_payload, ChannelCommand, InboundMessage, OutboundMessage,
    AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE,
};
use super::topics::TopicScheme;
use super::transport::{BrokerTransport, TransportEvent};
use crate::config::DeviceConfig;
use crate::connectivity::ConnectivityState;
use crate::relay::ChannelSnapshot;
use crate::synchronizer::StatePublisher;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub connect_attempts: usize,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// Boot-scoped session flags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionLifecycle {
    pub connected: bool,
    /// Set once discovery went out; only a restart clears it
    pub discovery_published: bool,
}

impl SessionLifecycle {
    pub fn reset_boot_scope(&mut self) {
        self.discovery_published = false;
    }
}

/// Outcome of [`BrokerSession::attempt_connect`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectAttempt {
    Started,
    /// Rate limited; the last attempt is too recent
    NotDue,
    /// Station link is not up, nothing was tried
    StationDown,
    AlreadyConnected,
    /// The transport refused to even start; retried on the next eligible tick
    Failed,
}

/// The single logical session to the broker.
///
/// Synchronous. The control loop calls [`attempt_connect`] and
/// [`service`] every tick, and the transport feeds connection progress and
/// inbound messages back as [`TransportEvent`]s.
///
/// [`attempt_connect`]: BrokerSession::attempt_connect
/// [`service`]: BrokerSession::service
pub struct BrokerSession<T: BrokerTransport> {
    transport: T,
    topics: TopicScheme,
    device: DeviceInfo,
    options: SessionOptions,
    retry_interval: Duration,
    last_attempt: Option<Instant>,
    lifecycle: SessionLifecycle,
    status: SessionStatus,
}

impl<T: BrokerTransport> BrokerSession<T> {
    pub fn new(
        transport: T,
        topics: TopicScheme,
        device: DeviceInfo,
        options: SessionOptions,
        retry_interval: Duration,
    ) -> Self {
        BrokerSession {
            transport,
            topics,
            device,
            options,
            retry_interval,
            last_attempt: None,
            lifecycle: SessionLifecycle::default(),
            status: SessionStatus::default(),
        }
    }

    pub fn from_config(transport: T, config: &DeviceConfig, credentials: BrokerCredentials) -> Self {
        let topics = TopicScheme::from_config(config);
        let options = SessionOptions {
            client_id: config.client_id(),
            credentials,
            keep_alive: config.timings.broker_keep_alive(),
            will_topic: topics.availability_topic(),
            will_payload: AVAILABILITY_OFFLINE.to_string(),
            will_retain: true,
        };
        Self::new(
            transport,
            topics,
            DeviceInfo::from_config(config),
            options,
            config.timings.broker_retry(),
        )
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.connected
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn credentials(&self) -> &BrokerCredentials {
        &self.options.credentials
    }

    pub fn lifecycle(&self) -> &SessionLifecycle {
        &self.lifecycle
    }

    pub fn reset_boot_scope(&mut self) {
        self.lifecycle.reset_boot_scope();
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Starts a connection attempt if the station link is up and the last
    /// attempt is at least one retry interval old.
    pub fn attempt_connect(&mut self, now: Instant, station: ConnectivityState) -> ConnectAttempt {
        if self.lifecycle.connected {
            return ConnectAttempt::AlreadyConnected;
        }
        if station != ConnectivityState::Connected {
            return ConnectAttempt::StationDown;
        }
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < self.retry_interval {
                return ConnectAttempt::NotDue;
            }
        }

        self.last_attempt = Some(now);
        self.status.connect_attempts += 1;
        info!(
            "Attempting broker connection to {}:{} (attempt {})",
            self.options.credentials.host,
            self.options.credentials.port,
            self.status.connect_attempts
        );

        match self.transport.open(&self.options) {
            Ok(()) => {
                self.status.connection_state = ConnectionState::Connecting;
                ConnectAttempt::Started
            }
            Err(e) => {
                warn!("Broker connection attempt failed: {}", e);
                self.status.connection_state = ConnectionState::Disconnected;
                self.status.last_error = Some(e.to_string());
                ConnectAttempt::Failed
            }
        }
    }

    /// Drains pending transport events and returns the channel commands that
    /// arrived, in order.
    pub fn service(
        &mut self,
        channels: &[ChannelSnapshot],
        active_count: usize,
    ) -> Vec<ChannelCommand> {
        let mut commands = Vec::new();

        while let Some(event) = self.transport.next_event() {
            match event {
                TransportEvent::Connected => self.on_connected(channels, active_count),
                TransportEvent::Disconnected(reason) => self.on_disconnected(reason),
                TransportEvent::Message(message) => {
                    if let Some(command) = self.resolve_command(&message, channels.len()) {
                        commands.push(command);
                    }
                }
            }
        }

        commands
    }

    fn on_connected(&mut self, channels: &[ChannelSnapshot], active_count: usize) {
        self.lifecycle.connected = true;
        self.status.connection_state = ConnectionState::Connected;
        self.status.last_error = None;
        self.touch();
        info!("Broker connected");

        let availability =
            OutboundMessage::retained(self.topics.availability_topic(), AVAILABILITY_ONLINE);
        self.send(&availability);

        for channel in channels {
            let topic = self.topics.command_topic(channel.index);
            match self.transport.subscribe(&topic) {
                Ok(()) => debug!("Subscribed to {}", topic),
                Err(e) => warn!("{}", e),
            }
        }

        if !self.lifecycle.discovery_published {
            let published = self.publish_discovery(channels, active_count);
            self.lifecycle.discovery_published = true;
            info!("Discovery published for {} channels", published);
        }

        self.publish_initial_states(channels, active_count);
    }

    fn on_disconnected(&mut self, reason: String) {
        if self.lifecycle.connected {
            warn!("Broker connection lost: {}", reason);
        } else {
            debug!("Broker connection attempt ended: {}", reason);
        }
        self.lifecycle.connected = false;
        self.status.connection_state = ConnectionState::Disconnected;
        self.status.last_error = Some(reason);
        self.transport.close();
    }

    fn resolve_command(&mut self, message: &InboundMessage, channel_count: usize) -> Option<ChannelCommand> {
        self.status.messages_received += 1;
        self.touch();

        let Some(index) = self.topics.channel_for_command(&message.topic, channel_count) else {
            debug!("Ignoring message on {}", message.topic);
            return None;
        };

        let value = parse_command_payload(&message.payload);
        info!("Command for relay {}: {}", index + 1, state_payload(value));
        Some(ChannelCommand { index, value })
    }

    /// Publishes one retained discovery config per active channel and
    /// returns how many went out.
    pub fn publish_discovery(&mut self, channels: &[ChannelSnapshot], active_count: usize) -> usize {
        let mut published = 0;
        for channel in channels.iter().take(active_count) {
            let discovery = SwitchDiscovery::new(&self.topics, channel.index, &channel.name, &self.device);
            match discovery.into_message(&self.topics, channel.index) {
                Ok(message) => {
                    if self.send(&message) {
                        published += 1;
                    }
                }
                Err(e) => error!("Failed to encode discovery for relay {}: {}", channel.index + 1, e),
            }
        }
        published
    }

    /// Republishes the retained state of every active channel.
    pub fn publish_initial_states(&mut self, channels: &[ChannelSnapshot], active_count: usize) -> usize {
        let mut published = 0;
        for channel in channels.iter().take(active_count) {
            let message = OutboundMessage::retained(
                self.topics.state_topic(channel.index),
                state_payload(channel.state),
            );
            if self.send(&message) {
                published += 1;
            }
        }
        debug!("Initial states published for {} channels", published);
        published
    }

    /// Marks the device offline and closes the session.
    pub fn shutdown(&mut self) {
        if self.lifecycle.connected {
            let offline =
                OutboundMessage::retained(self.topics.availability_topic(), AVAILABILITY_OFFLINE);
            self.send(&offline);
        }
        self.transport.close();
        self.lifecycle.connected = false;
        self.status.connection_state = ConnectionState::Disconnected;
        info!("Broker session closed");
    }

    fn send(&mut self, message: &OutboundMessage) -> bool {
        match self.transport.publish(message) {
            Ok(()) => {
                self.status.messages_sent += 1;
                self.touch();
                true
            }
            Err(e) => {
                self.status.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn touch(&mut self) {
        self.status.last_activity = Some(chrono::Local::now());
    }
}

impl<T: BrokerTransport> StatePublisher for BrokerSession<T> {
    fn publish_state(&mut self, index: usize, state: bool) -> bool {
        if !self.lifecycle.connected {
            debug!("Broker not connected, state of relay {} not published", index + 1);
            return false;
        }
        let message = OutboundMessage::retained(self.topics.state_topic(index), state_payload(state));
        self.send(&message)
    }
}
