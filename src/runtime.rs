//! Control loop
//!
//! One cooperative loop owns the supervisor, the broker session and the
//! synchronizer. It starts with the network bootstrap, during which control
//! requests are already served so the configuration portal can take new
//! station credentials. After that it wakes up for three reasons:
//!
//! - a link signal, applied to the supervisor immediately
//! - a control request, answered immediately
//! - the poll tick: drain queued link signals, poll the supervisor, try the
//!   broker if due and dispatch inbound broker commands
//!
//! The loop ends only when a restart was scheduled; the reason is handed
//! back to `main`.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::connectivity::{
    ConnectivityState, ConnectivitySupervisor, NetworkEvent, NetworkPlatform,
};
use crate::context::{DeviceContext, RestartReason};
use crate::control::control_handle::respond;
use crate::control::{AdminConfig, BrokerSettingsUpdate, BrokerStatus, ControlAction, ControlError};
use crate::mqtt::config::{BrokerCredentials, PASSWORD_MASK};
use crate::mqtt::mqtt_handler::BrokerSession;
use crate::mqtt::transport::BrokerTransport;
use crate::synchronizer::{CommandOrigin, StateSynchronizer};

enum Wakeup {
    Link(NetworkEvent),
    Action(ControlAction),
    Tick,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BootPhase {
    Station,
    Portal,
}

pub struct Controller<P: NetworkPlatform, T: BrokerTransport> {
    context: DeviceContext,
    supervisor: ConnectivitySupervisor<P>,
    session: BrokerSession<T>,
    synchronizer: StateSynchronizer,
    link_events: mpsc::Receiver<NetworkEvent>,
    actions: mpsc::Receiver<ControlAction>,
    poll_interval: Duration,
}

impl<P: NetworkPlatform, T: BrokerTransport> Controller<P, T> {
    pub fn new(
        context: DeviceContext,
        supervisor: ConnectivitySupervisor<P>,
        session: BrokerSession<T>,
        synchronizer: StateSynchronizer,
        link_events: mpsc::Receiver<NetworkEvent>,
        actions: mpsc::Receiver<ControlAction>,
    ) -> Self {
        let poll_interval = context.config().timings.poll_interval();
        Self {
            context,
            supervisor,
            session,
            synchronizer,
            link_events,
            actions,
            poll_interval,
        }
    }

    pub fn supervisor(&self) -> &ConnectivitySupervisor<P> {
        &self.supervisor
    }

    pub fn session(&self) -> &BrokerSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut BrokerSession<T> {
        &mut self.session
    }

    pub fn synchronizer(&self) -> &StateSynchronizer {
        &self.synchronizer
    }

    /// One-time blocking attach at boot.
    ///
    /// Tries the saved station network for one reconnect timeout, then hosts
    /// the configuration portal until the portal timeout runs out. Control
    /// requests are answered throughout; link loss signals are ignored.
    /// Returns the reason to restart if the device has to start over.
    pub async fn bootstrap(&mut self) -> Result<ConnectivityState, RestartReason> {
        let timings = self.supervisor.timings();
        let started = Instant::now();
        self.supervisor.begin_bootstrap(started);

        let mut phase = BootPhase::Station;
        let mut deadline = tokio::time::Instant::now() + timings.reconnect_timeout;

        loop {
            let wakeup = tokio::select! {
                Some(event) = self.link_events.recv() => Wakeup::Link(event),
                Some(action) = self.actions.recv() => Wakeup::Action(action),
                _ = tokio::time::sleep_until(deadline) => Wakeup::Tick,
            };

            match wakeup {
                Wakeup::Link(NetworkEvent::LinkDown) => {
                    debug!("Ignoring link loss during bootstrap");
                }
                Wakeup::Link(event) => {
                    let state = self.supervisor.handle_event(event);
                    info!("Network ready after {:?}", started.elapsed());
                    return Ok(state);
                }
                Wakeup::Action(action) => self.handle_action(action, Instant::now()),
                Wakeup::Tick => match phase {
                    BootPhase::Station => {
                        self.supervisor.open_portal(Instant::now());
                        phase = BootPhase::Portal;
                        deadline = tokio::time::Instant::now() + timings.portal_timeout;
                    }
                    BootPhase::Portal => {
                        error!("No network after {:?}", started.elapsed());
                        return Err(RestartReason::BootstrapTimeout);
                    }
                },
            }

            if let Some(reason) = self.pending_restart() {
                return Err(reason);
            }
        }
    }

    /// Bootstraps the network, then runs until a restart is scheduled.
    pub async fn run(mut self) -> RestartReason {
        if let Err(reason) = self.bootstrap().await {
            return reason;
        }

        info!("Control loop started, polling every {:?}", self.poll_interval);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let wakeup = tokio::select! {
                Some(event) = self.link_events.recv() => Wakeup::Link(event),
                Some(action) = self.actions.recv() => Wakeup::Action(action),
                _ = ticker.tick() => Wakeup::Tick,
            };

            match wakeup {
                Wakeup::Link(event) => {
                    self.supervisor.handle_event(event);
                }
                Wakeup::Action(action) => self.handle_action(action, Instant::now()),
                Wakeup::Tick => self.tick(Instant::now()),
            }

            if let Some(reason) = self.pending_restart() {
                self.session.shutdown();
                return reason;
            }
        }
    }

    fn pending_restart(&self) -> Option<RestartReason> {
        match self.context.restart_requested() {
            Ok(reason) => reason,
            Err(e) => {
                warn!("Restart flag unreadable: {}", e);
                None
            }
        }
    }

    fn active_channel_count(&self) -> usize {
        self.context
            .active_channel_count()
            .unwrap_or_else(|e| {
                warn!("Active channel count unreadable, advertising all: {}", e);
                self.synchronizer.channel_count()
            })
    }

    /// One poll iteration.
    pub fn tick(&mut self, now: Instant) {
        loop {
            match self.link_events.try_recv() {
                Ok(event) => {
                    self.supervisor.handle_event(event);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Link event source closed");
                    break;
                }
            }
        }

        let state = self.supervisor.poll(now);
        self.session.attempt_connect(now, state);

        let active = self.active_channel_count();
        let commands = self.session.service(&self.synchronizer.snapshot(), active);
        for command in commands {
            if let Err(e) = self.synchronizer.apply_command(
                command.index,
                command.value,
                CommandOrigin::Broker,
                &mut self.session,
            ) {
                warn!("Broker command ignored: {}", e);
            }
        }
    }

    pub fn handle_action(&mut self, action: ControlAction, now: Instant) {
        match action {
            ControlAction::ChannelSnapshot { response_tx } => {
                respond(response_tx, self.synchronizer.snapshot());
            }
            ControlAction::ApplyCommand {
                index,
                value,
                response_tx,
            } => {
                let result = self
                    .synchronizer
                    .apply_command(index, value, CommandOrigin::ControlSurface, &mut self.session)
                    .map_err(ControlError::from);
                respond(response_tx, result);
            }
            ControlAction::Toggle { index, response_tx } => {
                let result = self
                    .synchronizer
                    .toggle(index, CommandOrigin::ControlSurface, &mut self.session)
                    .map_err(ControlError::from);
                respond(response_tx, result);
            }
            ControlAction::SetAll { value, response_tx } => {
                respond(response_tx, self.synchronizer.apply_all(value, &mut self.session));
            }
            ControlAction::ConnectivitySnapshot { response_tx } => {
                respond(response_tx, self.supervisor.snapshot());
            }
            ControlAction::SetActiveChannelCount { count, response_tx } => {
                respond(response_tx, self.set_active_channel_count(count));
            }
            ControlAction::AdminConfig { response_tx } => {
                respond(response_tx, self.admin_config());
            }
            ControlAction::SetBrokerSettings { update, response_tx } => {
                respond(response_tx, self.set_broker_settings(update));
            }
            ControlAction::BrokerStatus { response_tx } => {
                respond(response_tx, self.broker_status());
            }
            ControlAction::ReconfigureStation {
                ssid,
                password,
                response_tx,
            } => {
                let result = self
                    .supervisor
                    .reconfigure_station(&ssid, &password, now)
                    .map_err(|e| ControlError::Network(e.to_string()));
                respond(response_tx, result);
            }
            ControlAction::ResetNetwork { response_tx } => {
                let result = self
                    .supervisor
                    .reset_network()
                    .map_err(|e| ControlError::Network(e.to_string()))
                    .and_then(|()| {
                        self.context
                            .request_restart(RestartReason::NetworkReset)
                            .map_err(ControlError::from)
                    });
                respond(response_tx, result);
            }
            ControlAction::Restart { response_tx } => {
                let result = self
                    .context
                    .request_restart(RestartReason::Requested)
                    .map_err(ControlError::from);
                respond(response_tx, result);
            }
        }
    }

    fn set_active_channel_count(&mut self, count: usize) -> Result<(), ControlError> {
        if !self.context.config().is_allowed_channel_count(count) {
            return Err(ControlError::InvalidChannelCount(count));
        }

        self.synchronizer
            .store_mut()
            .save_active_channel_count(count)
            .map_err(|e| ControlError::Storage(e.to_string()))?;
        self.context.set_active_channel_count(count)?;
        info!("Active channel count set to {}", count);
        self.context
            .request_restart(RestartReason::ActiveChannelCountChanged)?;
        Ok(())
    }

    fn admin_config(&self) -> Result<AdminConfig, ControlError> {
        let settings = self.context.settings()?;
        let config = self.context.config();
        let broker_password = if settings.broker.password.is_empty() {
            String::new()
        } else {
            PASSWORD_MASK.to_string()
        };

        Ok(AdminConfig {
            active_channels: settings.active_channel_count,
            total_channels: config.channel_count(),
            allowed_channel_counts: config.allowed_channel_counts.clone(),
            broker_host: settings.broker.host,
            broker_port: settings.broker.port,
            broker_user: settings.broker.username,
            broker_password,
        })
    }

    fn set_broker_settings(&mut self, update: BrokerSettingsUpdate) -> Result<(), ControlError> {
        let host = update.host.trim().to_string();
        if host.is_empty() {
            return Err(ControlError::InvalidBrokerSettings(
                "host must not be empty".to_string(),
            ));
        }
        let port = u16::try_from(update.port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                ControlError::InvalidBrokerSettings(format!("port {} outside 1..=65535", update.port))
            })?;

        let current = self.context.broker()?;
        let password = if update.password == PASSWORD_MASK {
            current.password
        } else {
            update.password
        };

        let credentials = BrokerCredentials {
            host,
            port,
            username: update.username,
            password,
        };

        self.synchronizer
            .store_mut()
            .save_broker_credentials(&credentials)
            .map_err(|e| ControlError::Storage(e.to_string()))?;
        info!(
            "Broker settings changed to {}:{}",
            credentials.host, credentials.port
        );
        self.context.set_broker(credentials)?;
        self.context
            .request_restart(RestartReason::BrokerSettingsChanged)?;
        Ok(())
    }

    fn broker_status(&self) -> BrokerStatus {
        let status = self.session.status();
        let credentials = self.session.credentials();
        BrokerStatus {
            host: credentials.host.clone(),
            port: credentials.port,
            connected: self.session.is_connected(),
            connection_state: status.connection_state,
            connect_attempts: status.connect_attempts,
            messages_received: status.messages_received,
            messages_sent: status.messages_sent,
            last_error: status.last_error.clone(),
            last_activity: status.last_activity.map(|t| t.to_rfc3339()),
        }
    }
}

impl<P: NetworkPlatform, T: BrokerTransport> Drop for Controller<P, T> {
    fn drop(&mut self) {
        if self.session.is_connected() {
            debug!("Control loop stopped, closing broker session");
            self.session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::control::ControlHandle;
    use crate::mqtt::message_manager::InboundMessage;
    use crate::mqtt::transport::TransportEvent;
    use crate::persistence::store::PersistentStore;
    use crate::connectivity::SupervisorTimings;
    use crate::testing::{
        simulated_bank, FakePlatform, MemoryBackend, PlatformCall, RecordingTransport,
    };
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use tokio::sync::oneshot;

    const ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

    struct Rig {
        controller: Controller<FakePlatform, RecordingTransport>,
        link_tx: mpsc::Sender<NetworkEvent>,
        handle: ControlHandle,
        backend: MemoryBackend,
        context: DeviceContext,
    }

    fn rig(active: usize) -> Rig {
        rig_with_timings(active, SupervisorTimings::from_config(&DeviceConfig::default()))
    }

    fn rig_with_timings(active: usize, timings: SupervisorTimings) -> Rig {
        let config = DeviceConfig::default();
        let backend = MemoryBackend::new();
        let store = PersistentStore::open(Box::new(backend.clone())).unwrap();
        let (bank, _log) = simulated_bank(&config);
        let synchronizer = StateSynchronizer::new(bank, store);

        let context = DeviceContext::new(config.clone(), active, config.broker.clone());
        let supervisor = ConnectivitySupervisor::new(
            FakePlatform::new(Ipv4Addr::new(10, 42, 0, 1)),
            timings,
            config.hostname.clone(),
            config.ap_ssid.clone(),
            config.ap_passphrase.clone(),
        );
        let session =
            BrokerSession::from_config(RecordingTransport::default(), &config, config.broker.clone());
        let (link_tx, link_rx) = mpsc::channel(8);
        let (handle, actions) = ControlHandle::new(context.clone(), 8);

        Rig {
            controller: Controller::new(
                context.clone(),
                supervisor,
                session,
                synchronizer,
                link_rx,
                actions,
            ),
            link_tx,
            handle,
            backend,
            context,
        }
    }

    fn connected_rig(active: usize) -> (Rig, Instant) {
        let mut rig = rig(active);
        let t0 = Instant::now();
        rig.link_tx.try_send(NetworkEvent::LinkUp { address: ADDR }).unwrap();
        rig.controller.tick(t0);
        assert_eq!(rig.controller.supervisor().state(), ConnectivityState::Connected);
        assert_eq!(rig.controller.session().transport().opens, 1);

        rig.controller
            .session_mut()
            .transport_mut()
            .push(TransportEvent::Connected);
        rig.controller.tick(t0 + Duration::from_secs(1));
        assert!(rig.controller.session().is_connected());
        (rig, t0)
    }

    #[test]
    fn queued_link_up_is_applied_before_the_poll() {
        let (rig, _) = connected_rig(16);
        let transport = rig.controller.session().transport();
        assert_eq!(transport.subscriptions.len(), 16);
        assert_eq!(transport.published_with_suffix("/config").len(), 16);
    }

    #[test]
    fn link_loss_suppresses_broker_attempts() {
        let (mut rig, t0) = connected_rig(8);
        rig.link_tx.try_send(NetworkEvent::LinkDown).unwrap();
        rig.controller
            .session_mut()
            .transport_mut()
            .push(TransportEvent::Disconnected("connection reset".to_string()));

        for s in 2..25 {
            rig.controller.tick(t0 + Duration::from_secs(s));
            assert_ne!(rig.controller.supervisor().state(), ConnectivityState::Connected);
        }
        assert!(!rig.controller.session().is_connected());
        assert_eq!(rig.controller.session().transport().opens, 1);

        rig.link_tx.try_send(NetworkEvent::LinkUp { address: ADDR }).unwrap();
        rig.controller.tick(t0 + Duration::from_secs(25));
        assert_eq!(rig.controller.session().transport().opens, 2);
    }

    #[test]
    fn broker_command_flows_through_the_loop() {
        let (mut rig, t0) = connected_rig(16);
        rig.controller.session_mut().transport_mut().published.clear();
        rig.controller
            .session_mut()
            .transport_mut()
            .push(TransportEvent::Message(InboundMessage::new(
                "homeassistant/switch/pi-relay/relay3/set",
                "ON",
            )));

        rig.controller.tick(t0 + Duration::from_secs(2));
        assert!(rig.controller.synchronizer().get_state(2));
        let published = &rig.controller.session().transport().published;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "homeassistant/switch/pi-relay/relay3/state");
        assert_eq!(rig.backend.commits(), 1);
    }

    #[test]
    fn channel_count_change_is_validated_persisted_and_restarts() {
        let (mut rig, _) = connected_rig(16);
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        rig.controller.handle_action(
            ControlAction::SetActiveChannelCount { count: 10, response_tx: tx },
            now,
        );
        assert_eq!(rx.try_recv().unwrap(), Err(ControlError::InvalidChannelCount(10)));
        assert_eq!(rig.context.restart_requested(), Ok(None));

        let (tx, mut rx) = oneshot::channel();
        rig.controller.handle_action(
            ControlAction::SetActiveChannelCount { count: 8, response_tx: tx },
            now,
        );
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(
            rig.context.restart_requested(),
            Ok(Some(RestartReason::ActiveChannelCountChanged))
        );

        let reopened = PersistentStore::open(Box::new(rig.backend.clone())).unwrap();
        assert_eq!(reopened.active_channel_count(), Some(8));
    }

    #[test]
    fn broker_settings_keep_masked_password() {
        let mut rig = rig(16);
        rig.context
            .set_broker(BrokerCredentials {
                password: "hunter2".to_string(),
                ..BrokerCredentials::default()
            })
            .unwrap();
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        rig.controller.handle_action(ControlAction::AdminConfig { response_tx: tx }, now);
        let admin = rx.try_recv().unwrap().unwrap();
        assert_eq!(admin.broker_password, PASSWORD_MASK);
        assert_eq!(admin.active_channels, 16);

        let (tx, mut rx) = oneshot::channel();
        rig.controller.handle_action(
            ControlAction::SetBrokerSettings {
                update: BrokerSettingsUpdate {
                    host: "broker.lan".to_string(),
                    port: 70000,
                    username: String::new(),
                    password: PASSWORD_MASK.to_string(),
                },
                response_tx: tx,
            },
            now,
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ControlError::InvalidBrokerSettings(_))
        ));

        let (tx, mut rx) = oneshot::channel();
        rig.controller.handle_action(
            ControlAction::SetBrokerSettings {
                update: BrokerSettingsUpdate {
                    host: "broker.lan".to_string(),
                    port: 1884,
                    username: "relay".to_string(),
                    password: PASSWORD_MASK.to_string(),
                },
                response_tx: tx,
            },
            now,
        );
        assert_eq!(rx.try_recv().unwrap(), Ok(()));

        let stored = PersistentStore::open(Box::new(rig.backend.clone()))
            .unwrap()
            .broker_credentials(&BrokerCredentials::default());
        assert_eq!(stored.host, "broker.lan");
        assert_eq!(stored.port, 1884);
        assert_eq!(stored.password, "hunter2");
        assert_eq!(
            rig.context.restart_requested(),
            Ok(Some(RestartReason::BrokerSettingsChanged))
        );
    }

    #[tokio::test]
    async fn handle_requests_are_served_and_restart_ends_the_loop() {
        let rig = rig(16);
        rig.link_tx.try_send(NetworkEvent::LinkUp { address: ADDR }).unwrap();
        let handle = rig.handle.clone();
        let loop_task = rig.controller.run();

        let client = async move {
            let report = handle.apply_command(0, true).await.unwrap();
            assert!(report.state);
            assert!(!report.published);
            assert!(report.persisted);

            let snapshot = handle.channel_snapshot().await.unwrap();
            assert!(snapshot[0].state);
            assert!(matches!(
                handle.apply_command(40, true).await,
                Err(ControlError::Relay(_))
            ));

            let status = handle.broker_status().await.unwrap();
            assert!(!status.connected);
            assert_eq!(status.host, "localhost");

            assert!(handle.verify_admin("admin"));
            assert!(!handle.verify_admin("nope"));

            handle.restart().await.unwrap();
        };

        let (reason, ()) = tokio::join!(loop_task, client);
        assert_eq!(reason, RestartReason::Requested);
        assert_eq!(rig.backend.commits(), 1);
    }

    fn short_timings() -> SupervisorTimings {
        SupervisorTimings {
            reconnect_timeout: Duration::from_millis(50),
            reconnect_cooldown: Duration::from_secs(60),
            portal_timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn bootstrap_ends_on_link_up_and_ignores_link_loss() {
        let mut rig = rig_with_timings(16, short_timings());
        rig.link_tx.try_send(NetworkEvent::LinkDown).unwrap();
        rig.link_tx.try_send(NetworkEvent::LinkUp { address: ADDR }).unwrap();

        let state = rig.controller.bootstrap().await;
        assert_eq!(state, Ok(ConnectivityState::Connected));
        assert!(!rig.controller.supervisor().platform().ap_started());
    }

    #[tokio::test]
    async fn bootstrap_gives_up_after_the_portal_timeout() {
        let mut rig = rig_with_timings(16, short_timings());

        let state = rig.controller.bootstrap().await;
        assert_eq!(state, Err(RestartReason::BootstrapTimeout));
        assert!(rig.controller.supervisor().platform().ap_started());
    }

    #[tokio::test]
    async fn portal_takes_new_credentials_while_bootstrapping() {
        let mut rig = rig_with_timings(16, short_timings());
        let handle = rig.handle.clone();

        let client = async move {
            loop {
                let snapshot = handle.connectivity_snapshot().await.unwrap();
                if snapshot.ap_mode_active {
                    assert_eq!(snapshot.ap_ssid.as_deref(), Some("Pi-Relay-Setup"));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            handle
                .reconfigure_station("home".to_string(), "secret".to_string())
                .await
                .unwrap();
            let snapshot = handle.connectivity_snapshot().await.unwrap();
            assert_eq!(snapshot.ssid.as_deref(), Some("home"));
            handle.restart().await.unwrap();
        };

        let (state, ()) = tokio::join!(rig.controller.bootstrap(), client);
        assert_eq!(state, Err(RestartReason::Requested));
        assert!(rig
            .controller
            .supervisor()
            .platform()
            .calls
            .contains(&PlatformCall::Join("home".to_string())));
    }
}
