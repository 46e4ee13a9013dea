//! Control Handle - async client side of the control loop

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{
    AdminConfig, BrokerSettingsUpdate, BrokerStatus, ControlAction, ControlError, Responder,
};
use crate::connectivity::ConnectivitySnapshot;
use crate::context::DeviceContext;
use crate::relay::ChannelSnapshot;
use crate::synchronizer::{ApplyReport, BulkReport};

/// Sends one request and waits for its answer.
macro_rules! request {
    ($handle:expr, $action:ident { $($field:ident),* }) => {{
        let (response_tx, response_rx) = oneshot::channel();
        $handle
            .tx
            .send(ControlAction::$action { $($field,)* response_tx })
            .await
            .map_err(|_| ControlError::ChannelClosed)?;
        response_rx.await.map_err(|_| ControlError::ResponseDropped)
    }};
}

#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlAction>,
    context: DeviceContext,
}

impl ControlHandle {
    /// Creates the handle and the receiver the control loop serves.
    pub fn new(context: DeviceContext, capacity: usize) -> (Self, mpsc::Receiver<ControlAction>) {
        let (tx, rx) = mpsc::channel(capacity);
        debug!("Control channel created with capacity {}", capacity);
        (Self { tx, context }, rx)
    }

    /// Plain comparison against the configured admin password.
    pub fn verify_admin(&self, password: &str) -> bool {
        let ok = self.context.config().admin_password == password;
        if !ok {
            warn!("Rejected admin login");
        }
        ok
    }

    pub async fn channel_snapshot(&self) -> Result<Vec<ChannelSnapshot>, ControlError> {
        request!(self, ChannelSnapshot {})
    }

    pub async fn apply_command(&self, index: usize, value: bool) -> Result<ApplyReport, ControlError> {
        request!(self, ApplyCommand { index, value })?
    }

    pub async fn toggle(&self, index: usize) -> Result<ApplyReport, ControlError> {
        request!(self, Toggle { index })?
    }

    pub async fn set_all(&self, value: bool) -> Result<BulkReport, ControlError> {
        request!(self, SetAll { value })
    }

    pub async fn connectivity_snapshot(&self) -> Result<ConnectivitySnapshot, ControlError> {
        request!(self, ConnectivitySnapshot {})
    }

    pub async fn set_active_channel_count(&self, count: usize) -> Result<(), ControlError> {
        request!(self, SetActiveChannelCount { count })?
    }

    pub async fn admin_config(&self) -> Result<AdminConfig, ControlError> {
        request!(self, AdminConfig {})?
    }

    pub async fn set_broker_settings(&self, update: BrokerSettingsUpdate) -> Result<(), ControlError> {
        request!(self, SetBrokerSettings { update })?
    }

    pub async fn broker_status(&self) -> Result<BrokerStatus, ControlError> {
        request!(self, BrokerStatus {})
    }

    pub async fn reconfigure_station(&self, ssid: String, password: String) -> Result<(), ControlError> {
        request!(self, ReconfigureStation { ssid, password })?
    }

    pub async fn reset_network(&self) -> Result<(), ControlError> {
        request!(self, ResetNetwork {})?
    }

    pub async fn restart(&self) -> Result<(), ControlError> {
        request!(self, Restart {})?
    }
}

/// Delivers a response, logging if the requester went away.
pub(crate) fn respond<T>(response_tx: Responder<T>, value: T) {
    if response_tx.send(value).is_err() {
        warn!("Control response dropped, requester gone");
    }
}
