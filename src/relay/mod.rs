//! Relay bank subsystem
//!
//! Owns the state of every relay channel and the output line behind it.
//!
//! 1. [`output`] - output drivers (rppal GPIO, simulated lines)
//! 2. [`relay_bank`] - channel table with a claim lifecycle
//!
//! # Lifecycle
//!
//! ```text
//! RelayBank<Unclaimed> ──claim()──► RelayBank<Ready>
//!   (channel table only)             (lines claimed, all OFF)
//! ```
//!
//! Only a `Ready` bank can be switched, so nothing can drive a line that was
//! never configured as an output.

pub mod output;
pub mod relay_bank;

pub use relay_bank::{Ready, RelayBank, Unclaimed};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The output line could not be configured; the relay is unusable
    #[error("Failed to claim output pin {pin}: {reason}")]
    HardwareClaim { pin: u8, reason: String },

    #[error("Invalid channel index {0}")]
    InvalidChannel(usize),
}

/// Point-in-time view of one channel, as served to the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub index: usize,
    pub name: String,
    pub state: bool,
    pub pin: u8,
}
