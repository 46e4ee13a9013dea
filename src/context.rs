//! Shared device context
//!
//! Settings that more than one component reads but exactly one writes live
//! here instead of in globals: the active channel count, the broker
//! credentials in effect and a pending restart request. Components get a
//! clone of the [`DeviceContext`] at construction and go through its
//! accessors, which retry the lock a bounded number of times instead of
//! waiting forever.

use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::DeviceConfig;
use crate::mqtt::config::BrokerCredentials;

macro_rules! try_lock {
    (@write_lock_retry, $accessor:expr, $operation:expr) => {{
        let mut attempts = 0;
        const MAX_ATTEMPTS: usize = 5;

        loop {
            match $accessor.try_write() {
                Ok(mut guard) => {
                    let result = $operation(&mut *guard);
                    break Ok(result);
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Write lock blocked: {} (attempt {}/{})",
                        e,
                        attempts,
                        MAX_ATTEMPTS
                    );

                    if attempts >= MAX_ATTEMPTS {
                        break Err($crate::context::ContextError::LockTimeout);
                    }

                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }};

    (@read_lock_retry, $accessor:expr, $operation:expr) => {{
        let mut attempts = 0;
        const MAX_ATTEMPTS: usize = 5;

        loop {
            match $accessor.try_read() {
                Ok(guard) => {
                    let result = $operation(&*guard);
                    break Ok(result);
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Read lock blocked: {} (attempt {}/{})",
                        e,
                        attempts,
                        MAX_ATTEMPTS
                    );

                    if attempts >= MAX_ATTEMPTS {
                        break Err($crate::context::ContextError::LockTimeout);
                    }

                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }};
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("Could not acquire lock after maximum retry attempts")]
    LockTimeout,
}

/// Why the process is about to restart. Restarting is the only escalation
/// path; it resets the device to a known-good state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RestartReason {
    BootstrapTimeout,
    ActiveChannelCountChanged,
    BrokerSettingsChanged,
    NetworkReset,
    Requested,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            RestartReason::BootstrapTimeout => "network bootstrap timed out",
            RestartReason::ActiveChannelCountChanged => "active channel count changed",
            RestartReason::BrokerSettingsChanged => "broker settings changed",
            RestartReason::NetworkReset => "network settings reset",
            RestartReason::Requested => "restart requested",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub active_channel_count: usize,
    pub broker: BrokerCredentials,
    pub restart: Option<RestartReason>,
}

#[derive(Clone)]
pub struct DeviceContext {
    config: Arc<DeviceConfig>,
    settings: Arc<RwLock<RuntimeSettings>>,
}

impl DeviceContext {
    pub fn new(config: DeviceConfig, active_channel_count: usize, broker: BrokerCredentials) -> Self {
        Self {
            config: Arc::new(config),
            settings: Arc::new(RwLock::new(RuntimeSettings {
                active_channel_count,
                broker,
                restart: None,
            })),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn settings(&self) -> Result<RuntimeSettings, ContextError> {
        try_lock!(@read_lock_retry, self.settings, |s: &RuntimeSettings| s.clone())
    }

    pub fn active_channel_count(&self) -> Result<usize, ContextError> {
        try_lock!(@read_lock_retry, self.settings, |s: &RuntimeSettings| s
            .active_channel_count)
    }

    pub fn set_active_channel_count(&self, count: usize) -> Result<(), ContextError> {
        try_lock!(@write_lock_retry, self.settings, |s: &mut RuntimeSettings| {
            s.active_channel_count = count;
        })
    }

    pub fn broker(&self) -> Result<BrokerCredentials, ContextError> {
        try_lock!(@read_lock_retry, self.settings, |s: &RuntimeSettings| s.broker.clone())
    }

    pub fn set_broker(&self, broker: BrokerCredentials) -> Result<(), ContextError> {
        try_lock!(@write_lock_retry, self.settings, |s: &mut RuntimeSettings| {
            s.broker = broker;
        })
    }

    /// Records a restart request. The first reason sticks.
    pub fn request_restart(&self, reason: RestartReason) -> Result<(), ContextError> {
        try_lock!(@write_lock_retry, self.settings, |s: &mut RuntimeSettings| {
            if s.restart.is_none() {
                info!("Restart scheduled: {}", reason);
                s.restart = Some(reason);
            }
        })
    }

    pub fn restart_requested(&self) -> Result<Option<RestartReason>, ContextError> {
        try_lock!(@read_lock_retry, self.settings, |s: &RuntimeSettings| s.restart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DeviceContext {
        DeviceContext::new(DeviceConfig::default(), 16, BrokerCredentials::default())
    }

    #[test]
    fn accessors_read_what_was_written() {
        let ctx = context();
        assert_eq!(ctx.active_channel_count(), Ok(16));

        ctx.set_active_channel_count(8).unwrap();
        let clone = ctx.clone();
        assert_eq!(clone.active_channel_count(), Ok(8));

        let creds = BrokerCredentials {
            host: "broker.lan".to_string(),
            ..BrokerCredentials::default()
        };
        ctx.set_broker(creds.clone()).unwrap();
        assert_eq!(clone.broker(), Ok(creds));
    }

    #[test]
    fn first_restart_reason_wins() {
        let ctx = context();
        assert_eq!(ctx.restart_requested(), Ok(None));

        ctx.request_restart(RestartReason::BrokerSettingsChanged).unwrap();
        ctx.request_restart(RestartReason::Requested).unwrap();
        assert_eq!(
            ctx.restart_requested(),
            Ok(Some(RestartReason::BrokerSettingsChanged))
        );
    }

    #[tokio::test]
    async fn held_write_lock_times_out() {
        let ctx = context();
        let guard = ctx.settings.write().await;
        assert_eq!(ctx.active_channel_count(), Err(ContextError::LockTimeout));
        drop(guard);
        assert_eq!(ctx.active_channel_count(), Ok(16));
    }
}
