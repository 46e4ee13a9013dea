//! Link Monitor - turns the station interface status into link signals
//!
//! NetworkManager is queried on a short interval. Only changes are reported:
//! `LinkUp` when the interface becomes connected with an IPv4 address (or
//! its address changes), `LinkDown` when it stops being connected.

use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::nmcli::parse_ipv4_cidr;
use super::platform::NetworkEvent;

/// NetworkManager device state for "connected"
const NM_DEVICE_CONNECTED: &str = "100";

/// Edge detector over successive link observations.
#[derive(Debug, Default)]
pub struct LinkTracker {
    current: Option<Ipv4Addr>,
}

impl LinkTracker {
    /// Feeds one observation; `Some(address)` means connected.
    pub fn observe(&mut self, link: Option<Ipv4Addr>) -> Option<NetworkEvent> {
        if link == self.current {
            return None;
        }
        self.current = link;

        match link {
            Some(address) => Some(NetworkEvent::LinkUp { address }),
            None => Some(NetworkEvent::LinkDown),
        }
    }
}

/// Parses `nmcli -g GENERAL.STATE,IP4.ADDRESS device show <iface>`.
pub fn parse_device_status(output: &str) -> Option<Ipv4Addr> {
    let mut lines = output.lines();
    let state = lines.next()?.trim();
    if !state.starts_with(NM_DEVICE_CONNECTED) {
        return None;
    }
    lines.find_map(parse_ipv4_cidr)
}

async fn query_link(interface: &str) -> Option<Ipv4Addr> {
    let output = Command::new("nmcli")
        .args(["-g", "GENERAL.STATE,IP4.ADDRESS", "device", "show", interface])
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            parse_device_status(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            debug!(
                "nmcli device show failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
            None
        }
        Err(e) => {
            warn!("Unable to query link state: {}", e);
            None
        }
    }
}

pub struct LinkMonitor {}

impl LinkMonitor {
    /// Spawns the monitor task. It stops when `cancel` fires or the receiving
    /// side of `sender` is gone.
    pub fn spawn(
        interface: String,
        interval: Duration,
        sender: mpsc::Sender<NetworkEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        info!("Starting link monitor on {}", interface);
        tokio::spawn(async move {
            let mut tracker = LinkTracker::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let link = query_link(&interface).await;
                if let Some(event) = tracker.observe(link) {
                    debug!("Link event: {:?}", event);
                    if sender.send(event).await.is_err() {
                        debug!("Link event receiver dropped");
                        break;
                    }
                }
            }
            info!("Link monitor on {} stopped", interface);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const A: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);
    const B: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 51);

    #[test]
    fn only_changes_are_reported() {
        let mut tracker = LinkTracker::default();
        assert_eq!(tracker.observe(None), None);
        assert_eq!(tracker.observe(None), None);
        assert_eq!(tracker.observe(Some(A)), Some(NetworkEvent::LinkUp { address: A }));
        assert_eq!(tracker.observe(Some(A)), None);
        assert_eq!(tracker.observe(Some(B)), Some(NetworkEvent::LinkUp { address: B }));
        assert_eq!(tracker.observe(None), Some(NetworkEvent::LinkDown));
        assert_eq!(tracker.observe(None), None);
    }

    #[test]
    fn link_already_up_at_start_is_reported() {
        let mut tracker = LinkTracker::default();
        assert_eq!(tracker.observe(Some(A)), Some(NetworkEvent::LinkUp { address: A }));
    }

    #[test]
    fn device_status_needs_connected_state_and_address() {
        assert_eq!(parse_device_status("100 (connected)\n192.168.1.50/24\n"), Some(A));
        assert_eq!(parse_device_status("30 (disconnected)\n\n"), None);
        assert_eq!(parse_device_status("100 (connected)\n\n"), None);
        assert_eq!(parse_device_status(""), None);
    }
}
