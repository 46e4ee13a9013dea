use statum::{machine, state};
use tracing::{debug, error, info};

use super::output::{OutputDriver, OutputLine};
use super::{ChannelSnapshot, RelayError};
use crate::config::ChannelDefinition;

// One relay channel; `state` mirrors the last write to its line
#[derive(Debug, Clone, PartialEq, Eq)]
struct Channel {
    index: usize,
    pin: u8,
    name: String,
    state: bool,
}

#[state]
#[derive(Debug, Clone)]
pub enum BankState {
    Unclaimed,
    Ready,
}

#[machine]
pub struct RelayBank<S: BankState> {
    channels: Vec<Channel>,
    lines: Vec<Box<dyn OutputLine>>,
    driver: Box<dyn OutputDriver>,
}

// Methods available in all states
impl<S: BankState> RelayBank<S> {
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.channels
            .iter()
            .map(|c| ChannelSnapshot {
                index: c.index,
                name: c.name.clone(),
                state: c.state,
                pin: c.pin,
            })
            .collect()
    }

    /// Last applied value; `false` for an unknown index.
    pub fn get_state(&self, index: usize) -> bool {
        self.channels.get(index).map(|c| c.state).unwrap_or(false)
    }

    pub fn states(&self) -> Vec<bool> {
        self.channels.iter().map(|c| c.state).collect()
    }
}

impl RelayBank<Unclaimed> {
    pub fn create(definitions: &[ChannelDefinition], driver: Box<dyn OutputDriver>) -> Self {
        let channels = definitions
            .iter()
            .enumerate()
            .map(|(index, def)| Channel {
                index,
                pin: def.pin,
                name: def.name.clone(),
                state: false,
            })
            .collect::<Vec<_>>();

        debug!("Creating relay bank with {} channels", channels.len());
        Self::new(channels, Vec::new(), driver)
    }

    /// Claims every output line and drives it OFF.
    ///
    /// A line that cannot be claimed is a hardware fault. There is no retry;
    /// the caller is expected to give up.
    pub fn claim(mut self) -> Result<RelayBank<Ready>, RelayError> {
        let mut lines = Vec::with_capacity(self.channels.len());

        for channel in &mut self.channels {
            let mut line = match self.driver.claim(channel.pin) {
                Ok(line) => line,
                Err(e) => {
                    error!("Relay {} unusable: {}", channel.index + 1, e);
                    return Err(e);
                }
            };
            line.write(false);
            channel.state = false;
            lines.push(line);
        }

        self.lines = lines;
        info!("Relays initialized ({} channels, all OFF)", self.channels.len());
        Ok(self.transition())
    }
}

impl RelayBank<Ready> {
    /// Drives one channel. Exactly one output write per successful call,
    /// even if the value does not change.
    pub fn set_state(&mut self, index: usize, value: bool) -> Result<(), RelayError> {
        let (Some(channel), Some(line)) = (self.channels.get_mut(index), self.lines.get_mut(index))
        else {
            debug!("Ignoring write to invalid channel {}", index);
            return Err(RelayError::InvalidChannel(index));
        };

        line.write(value);
        channel.state = value;
        info!(
            "Relay {} set to {}",
            index + 1,
            if value { "ON" } else { "OFF" }
        );
        Ok(())
    }

    /// Flips a channel and returns its new state.
    pub fn toggle(&mut self, index: usize) -> Result<bool, RelayError> {
        if index >= self.channels.len() {
            return Err(RelayError::InvalidChannel(index));
        }
        let value = !self.get_state(index);
        self.set_state(index, value)?;
        Ok(value)
    }

    pub fn all_on(&mut self) {
        self.set_all(true);
    }

    pub fn all_off(&mut self) {
        self.set_all(false);
    }

    fn set_all(&mut self, value: bool) {
        for index in 0..self.channels.len() {
            // indices come from the table itself
            let _ = self.set_state(index, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::relay::output::SimulatedDriver;
    use pretty_assertions::assert_eq;

    fn ready_bank() -> (RelayBank<Ready>, crate::relay::output::WriteLog) {
        let driver = SimulatedDriver::new();
        let log = driver.write_log();
        let bank = RelayBank::create(&DeviceConfig::default().channels, Box::new(driver))
            .claim()
            .unwrap();
        (bank, log)
    }

    #[test]
    fn claim_drives_every_line_off() {
        let (bank, log) = ready_bank();
        assert_eq!(bank.len(), 16);
        assert_eq!(bank.states(), vec![false; 16]);

        let writes = log.lock().unwrap();
        assert!(writes.iter().all(|(_, level)| !level));
        assert!(writes.len() >= 16);
    }

    #[test]
    fn claim_failure_is_fatal() {
        let config = DeviceConfig::default();
        let bad_pin = config.channels[4].pin;
        let driver = SimulatedDriver::new().with_unavailable(&[bad_pin]);

        let result = RelayBank::create(&config.channels, Box::new(driver)).claim();
        assert!(matches!(
            result,
            Err(RelayError::HardwareClaim { pin, .. }) if pin == bad_pin
        ));
    }

    #[test]
    fn set_state_writes_once_per_call() {
        let (mut bank, log) = ready_bank();
        log.lock().unwrap().clear();

        bank.set_state(2, true).unwrap();
        bank.set_state(2, true).unwrap();

        let pin = DeviceConfig::default().channels[2].pin;
        assert_eq!(*log.lock().unwrap(), vec![(pin, true), (pin, true)]);
        assert!(bank.get_state(2));
    }

    #[test]
    fn invalid_index_changes_nothing() {
        let (mut bank, log) = ready_bank();
        log.lock().unwrap().clear();

        assert_eq!(bank.set_state(16, true), Err(RelayError::InvalidChannel(16)));
        assert_eq!(bank.toggle(99), Err(RelayError::InvalidChannel(99)));
        assert!(!bank.get_state(16));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bank.states(), vec![false; 16]);
    }

    #[test]
    fn toggle_and_bulk_operations() {
        let (mut bank, _log) = ready_bank();

        assert_eq!(bank.toggle(0), Ok(true));
        assert_eq!(bank.toggle(0), Ok(false));

        bank.all_on();
        assert_eq!(bank.states(), vec![true; 16]);
        bank.all_off();
        assert_eq!(bank.states(), vec![false; 16]);
    }

    #[test]
    fn snapshot_carries_names_and_pins() {
        let (mut bank, _log) = ready_bank();
        bank.set_state(0, true).unwrap();

        let snap = bank.snapshot();
        let config = DeviceConfig::default();
        assert_eq!(
            snap[0],
            ChannelSnapshot {
                index: 0,
                name: "Relay 1".to_string(),
                state: true,
                pin: config.channels[0].pin,
            }
        );
    }
}
