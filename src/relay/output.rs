//! Physical output lines.
//!
//! A driver hands out one [`OutputLine`] per pin. Claiming configures the
//! line as an output driven low, so a freshly claimed relay is always OFF.

use rppal::gpio::{Gpio, OutputPin};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::RelayError;

pub trait OutputLine {
    fn write(&mut self, level: bool);
}

pub trait OutputDriver {
    fn claim(&mut self, pin: u8) -> Result<Box<dyn OutputLine>, RelayError>;
}

/// Raspberry Pi GPIO through rppal.
pub struct GpioDriver {
    gpio: Option<Gpio>,
}

impl GpioDriver {
    pub fn new() -> Self {
        Self { gpio: None }
    }
}

impl Default for GpioDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDriver for GpioDriver {
    fn claim(&mut self, pin: u8) -> Result<Box<dyn OutputLine>, RelayError> {
        if self.gpio.is_none() {
            let gpio = Gpio::new().map_err(|e| RelayError::HardwareClaim {
                pin,
                reason: e.to_string(),
            })?;
            info!("GPIO controller opened");
            self.gpio = Some(gpio);
        }

        let gpio = self.gpio.as_ref().ok_or(RelayError::HardwareClaim {
            pin,
            reason: "GPIO controller unavailable".to_string(),
        })?;

        let line = gpio
            .get(pin)
            .map_err(|e| RelayError::HardwareClaim {
                pin,
                reason: e.to_string(),
            })?
            .into_output_low();

        debug!("Claimed GPIO {} as output", pin);
        Ok(Box::new(GpioLine { pin: line }))
    }
}

struct GpioLine {
    pin: OutputPin,
}

impl OutputLine for GpioLine {
    fn write(&mut self, level: bool) {
        if level {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

/// Every write ever made to a simulated line, in order, as `(pin, level)`.
pub type WriteLog = Arc<Mutex<Vec<(u8, bool)>>>;

/// In-memory driver for running without relay hardware. Writes are logged
/// and recorded.
#[derive(Default)]
pub struct SimulatedDriver {
    writes: WriteLog,
    unavailable: Vec<u8>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins listed here fail to claim.
    pub fn with_unavailable(mut self, pins: &[u8]) -> Self {
        self.unavailable.extend_from_slice(pins);
        self
    }

    pub fn write_log(&self) -> WriteLog {
        self.writes.clone()
    }
}

impl OutputDriver for SimulatedDriver {
    fn claim(&mut self, pin: u8) -> Result<Box<dyn OutputLine>, RelayError> {
        if self.unavailable.contains(&pin) {
            return Err(RelayError::HardwareClaim {
                pin,
                reason: "line busy".to_string(),
            });
        }
        let mut line = SimulatedLine {
            pin,
            writes: self.writes.clone(),
        };
        line.write(false);
        Ok(Box::new(line))
    }
}

struct SimulatedLine {
    pin: u8,
    writes: WriteLog,
}

impl OutputLine for SimulatedLine {
    fn write(&mut self, level: bool) {
        debug!("Simulated GPIO {} -> {}", self.pin, if level { "HIGH" } else { "LOW" });
        if let Ok(mut log) = self.writes.lock() {
            log.push((self.pin, level));
        }
    }
}
