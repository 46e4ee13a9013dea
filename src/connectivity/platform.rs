use std::net::Ipv4Addr;

/// Asynchronous link signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Station link is up and has an address
    LinkUp { address: Ipv4Addr },
    LinkDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RadioMode {
    Station,
    /// Access point hosted next to the station interface
    AccessPointStation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StationInfo {
    pub ssid: String,
    pub ip: Option<Ipv4Addr>,
    pub rssi: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Failed to run {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Unexpected output from {program}: {output}")]
    Parse { program: String, output: String },
}

/// Radio control supplied by the host. Every call returns promptly;
/// connection progress is reported separately as [`NetworkEvent`]s.
pub trait NetworkPlatform {
    /// Starts a station attempt with the saved credentials.
    fn begin_station(&mut self) -> Result<(), PlatformError>;

    /// Starts a station attempt with new credentials, which replace the saved ones.
    fn join(&mut self, ssid: &str, password: &str) -> Result<(), PlatformError>;

    fn forget_station(&mut self) -> Result<(), PlatformError>;

    fn set_mode(&mut self, mode: RadioMode) -> Result<(), PlatformError>;

    /// Brings the access point up and returns its address when known.
    fn start_access_point(
        &mut self,
        ssid: &str,
        passphrase: &str,
    ) -> Result<Option<Ipv4Addr>, PlatformError>;

    fn access_point_clients(&mut self) -> usize;

    fn station_info(&mut self) -> Option<StationInfo>;

    /// (Re)publishes `hostname` bound to `address` for local name resolution.
    fn restart_advertisement(
        &mut self,
        hostname: &str,
        address: Ipv4Addr,
    ) -> Result<(), PlatformError>;
}
