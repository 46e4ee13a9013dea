//! NetworkManager backed radio control.
//!
//! Station and access point connections are managed with `nmcli`, attached
//! access point clients are counted with `iw` and the hostname is published
//! with `avahi-publish`. The access point runs on a virtual interface next to
//! the station interface so a background station attempt does not take it
//! down.

use std::net::Ipv4Addr;
use std::process::{Child, Command, Stdio};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

use super::platform::{NetworkPlatform, PlatformError, RadioMode, StationInfo};

const AP_CONNECTION: &str = "relaycontroller-ap";
const WIFI_TYPE: &str = "802-11-wireless";

pub struct NmcliPlatform {
    interface: String,
    ap_interface: String,
    advertiser: Option<Child>,
}

impl NmcliPlatform {
    pub fn new(interface: impl Into<String>) -> Self {
        let interface = interface.into();
        let ap_interface = format!("{}_ap", interface);
        Self {
            interface,
            ap_interface,
            advertiser: None,
        }
    }

    fn stop_advertiser(&mut self) {
        if let Some(mut child) = self.advertiser.take() {
            if let Err(e) = child.kill() {
                debug!("Advertiser already gone: {}", e);
            }
            if let Err(e) = child.wait() {
                debug!("Advertiser not reaped: {}", e);
            }
        }
    }
}

/// Runs `program` to completion. On a multi-threaded runtime the wait moves
/// off the worker so link events and ticks keep flowing.
fn run(program: &str, args: &[&str]) -> Result<String, PlatformError> {
    debug!("Running {} {}", program, args.join(" "));
    let execute = || {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
    };
    let output = match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(execute)
        }
        _ => execute(),
    }
    .map_err(|e| PlatformError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(PlatformError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl NetworkPlatform for NmcliPlatform {
    fn begin_station(&mut self) -> Result<(), PlatformError> {
        run("nmcli", &["--wait", "0", "device", "connect", &self.interface])?;
        Ok(())
    }

    fn join(&mut self, ssid: &str, password: &str) -> Result<(), PlatformError> {
        let mut args = vec!["--wait", "0", "device", "wifi", "connect", ssid];
        if !password.is_empty() {
            args.extend(["password", password]);
        }
        args.extend(["ifname", self.interface.as_str()]);
        run("nmcli", &args)?;
        Ok(())
    }

    fn forget_station(&mut self) -> Result<(), PlatformError> {
        let listing = run("nmcli", &["-t", "-f", "NAME,TYPE", "connection", "show"])?;
        for name in wifi_connections(&listing) {
            if name == AP_CONNECTION {
                continue;
            }
            debug!("Deleting saved connection {}", name);
            run("nmcli", &["connection", "delete", &name])?;
        }
        Ok(())
    }

    fn set_mode(&mut self, mode: RadioMode) -> Result<(), PlatformError> {
        match mode {
            RadioMode::Station => {
                if let Err(e) = run("nmcli", &["connection", "down", AP_CONNECTION]) {
                    debug!("Access point connection not active: {}", e);
                }
                if let Err(e) = run("iw", &["dev", &self.ap_interface, "del"]) {
                    debug!("No access point interface to remove: {}", e);
                }
                Ok(())
            }
            RadioMode::AccessPointStation => {
                let existing = run("iw", &["dev"])?;
                if existing.contains(&format!("Interface {}", self.ap_interface)) {
                    return Ok(());
                }
                run(
                    "iw",
                    &[
                        "dev",
                        &self.interface,
                        "interface",
                        "add",
                        &self.ap_interface,
                        "type",
                        "__ap",
                    ],
                )?;
                Ok(())
            }
        }
    }

    fn start_access_point(
        &mut self,
        ssid: &str,
        passphrase: &str,
    ) -> Result<Option<Ipv4Addr>, PlatformError> {
        if let Err(e) = run("nmcli", &["connection", "delete", AP_CONNECTION]) {
            debug!("No previous access point connection: {}", e);
        }

        run(
            "nmcli",
            &[
                "connection",
                "add",
                "type",
                "wifi",
                "ifname",
                &self.ap_interface,
                "con-name",
                AP_CONNECTION,
                "autoconnect",
                "no",
                "ssid",
                ssid,
                "802-11-wireless.mode",
                "ap",
                "ipv4.method",
                "shared",
                "wifi-sec.key-mgmt",
                "wpa-psk",
                "wifi-sec.psk",
                passphrase,
            ],
        )?;
        run("nmcli", &["connection", "up", AP_CONNECTION])?;

        let address = run("nmcli", &["-g", "IP4.ADDRESS", "device", "show", &self.ap_interface])?;
        Ok(parse_ipv4_cidr(&address))
    }

    fn access_point_clients(&mut self) -> usize {
        match run("iw", &["dev", &self.ap_interface, "station", "dump"]) {
            Ok(dump) => count_stations(&dump),
            Err(e) => {
                debug!("Station dump unavailable: {}", e);
                0
            }
        }
    }

    fn station_info(&mut self) -> Option<StationInfo> {
        let networks = run(
            "nmcli",
            &[
                "-t",
                "-f",
                "ACTIVE,SSID,SIGNAL",
                "device",
                "wifi",
                "list",
                "ifname",
                &self.interface,
                "--rescan",
                "no",
            ],
        )
        .ok()?;
        let (ssid, signal) = active_network(&networks)?;

        let ip = run("nmcli", &["-g", "IP4.ADDRESS", "device", "show", &self.interface])
            .ok()
            .and_then(|out| parse_ipv4_cidr(&out));

        Some(StationInfo {
            ssid,
            ip,
            rssi: signal.map(signal_to_rssi),
        })
    }

    fn restart_advertisement(
        &mut self,
        hostname: &str,
        address: Ipv4Addr,
    ) -> Result<(), PlatformError> {
        self.stop_advertiser();

        let name = format!("{}.local", hostname);
        let address = address.to_string();
        let child = Command::new("avahi-publish")
            .args(["-a", "-R", name.as_str(), address.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PlatformError::Spawn {
                program: "avahi-publish".to_string(),
                reason: e.to_string(),
            })?;

        self.advertiser = Some(child);
        Ok(())
    }
}

impl Drop for NmcliPlatform {
    fn drop(&mut self) {
        self.stop_advertiser();
    }
}

/// Splits one line of `nmcli -t` output on unescaped colons.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// First address of `nmcli -g IP4.ADDRESS` output (`10.42.0.1/24`).
pub fn parse_ipv4_cidr(output: &str) -> Option<Ipv4Addr> {
    output
        .split(|c: char| c == '|' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .find_map(|entry| entry.split('/').next()?.trim().parse().ok())
}

pub fn count_stations(dump: &str) -> usize {
    dump.lines()
        .filter(|line| line.starts_with("Station "))
        .count()
}

/// SSID and signal quality of the network marked active.
pub fn active_network(listing: &str) -> Option<(String, Option<u8>)> {
    listing.lines().find_map(|line| {
        let fields = split_terse(line);
        match fields.as_slice() {
            [active, ssid, signal] if active == "yes" => {
                Some((ssid.clone(), signal.trim().parse().ok()))
            }
            _ => None,
        }
    })
}

pub fn wifi_connections(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            match fields.as_slice() {
                [name, kind] if kind == WIFI_TYPE => Some(name.clone()),
                _ => None,
            }
        })
        .collect()
}

/// NetworkManager reports signal quality in percent; map it onto dBm.
pub fn signal_to_rssi(quality: u8) -> i32 {
    i32::from(quality.min(100)) / 2 - 100
}
