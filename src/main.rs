pub mod config;
pub mod connectivity;
pub mod context;
pub mod control;
pub mod mqtt;
pub mod persistence;
pub mod relay;
pub mod runtime;
pub mod synchronizer;
pub mod system;

#[cfg(test)]
mod testing;

use crate::config::{DeviceConfig, OutputBackend};
use crate::connectivity::link_monitor::LinkMonitor;
use crate::connectivity::nmcli::NmcliPlatform;
use crate::connectivity::ConnectivitySupervisor;
use crate::context::{DeviceContext, RestartReason};
use crate::control::ControlHandle;
use crate::mqtt::mqtt_handler::BrokerSession;
use crate::mqtt::transport::RumqttTransport;
use crate::persistence::store::{PersistentStore, TomlFileBackend};
use crate::relay::output::{GpioDriver, OutputDriver, SimulatedDriver};
use crate::relay::RelayBank;
use crate::runtime::Controller;
use crate::synchronizer::StateSynchronizer;
use color_eyre::{eyre::eyre, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const LINK_EVENT_CAPACITY: usize = 16;
const CONTROL_CAPACITY: usize = 32;
const BROKER_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = config::config_path();
    info!("Loading configuration from {}", config_path.display());
    let config = DeviceConfig::ensure_and_load(&config_path).await?;
    let restart_delay = config.timings.restart_delay();

    let reason = tokio::select! {
        reason = run(config) => reason?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            return Ok(());
        }
    };

    system::restart_process(reason, restart_delay).await
}

async fn run(config: DeviceConfig) -> Result<RestartReason> {
    let store = PersistentStore::open_or_empty(Box::new(TomlFileBackend::new(
        config.state_file_path(),
    )));
    let persisted = store.restore(&config);

    let driver: Box<dyn OutputDriver> = match config.output_backend {
        OutputBackend::Gpio => Box::new(GpioDriver::new()),
        OutputBackend::Simulated => {
            warn!("Using simulated relay outputs");
            Box::new(SimulatedDriver::new())
        }
    };
    let relays = RelayBank::create(&config.channels, driver)
        .claim()
        .map_err(|e| eyre!("Relay hardware unusable: {}", e))?;

    let mut synchronizer = StateSynchronizer::new(relays, store);
    synchronizer.restore(&persisted.channel_states);

    let context = DeviceContext::new(
        config.clone(),
        persisted.active_channel_count,
        persisted.broker.clone(),
    );

    let cancel = CancellationToken::new();
    let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_CAPACITY);
    let _monitor = LinkMonitor::spawn(
        config.interface.clone(),
        config.timings.poll_interval(),
        link_tx,
        cancel.clone(),
    );
    let _guard = cancel.drop_guard();

    let supervisor =
        ConnectivitySupervisor::from_config(NmcliPlatform::new(config.interface.clone()), &config);
    let session = BrokerSession::from_config(
        RumqttTransport::new(BROKER_CAPACITY),
        &config,
        persisted.broker,
    );

    // The control channel exists before bootstrap so the portal can use it.
    let (handle, actions) = ControlHandle::new(context.clone(), CONTROL_CAPACITY);
    spawn_restart_on_hangup(handle)?;

    let controller = Controller::new(context, supervisor, session, synchronizer, link_rx, actions);
    Ok(controller.run().await)
}

/// SIGHUP schedules a restart through the control loop, so the device can
/// pick up an edited config file.
fn spawn_restart_on_hangup(handle: ControlHandle) -> Result<()> {
    let mut hangup =
        signal(SignalKind::hangup()).map_err(|e| eyre!("Failed to install SIGHUP handler: {}", e))?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, scheduling restart");
            if let Err(e) = handle.restart().await {
                warn!("Restart request failed: {}", e);
                break;
            }
        }
        debug!("SIGHUP handler stopped");
    });
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
