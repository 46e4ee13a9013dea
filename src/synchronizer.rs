//! State Synchronizer
//!
//! Every relay mutation goes through [`StateSynchronizer`], whatever its
//! origin. One mutation is three independent, best-effort steps:
//!
//! 1. drive the relay bank
//! 2. publish the new channel state if a broker session is up (not queued)
//! 3. persist the full channel table
//!
//! There is no rollback. Persisting the full table on every mutation means a
//! failure between steps only ever leaves storage stale, never half written.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::persistence::store::PersistentStore;
use crate::relay::{ChannelSnapshot, Ready, RelayBank, RelayError};

/// Outward publication of a channel state.
pub trait StatePublisher {
    /// Returns whether the state actually went out.
    fn publish_state(&mut self, index: usize, state: bool) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CommandOrigin {
    Broker,
    ControlSurface,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub index: usize,
    pub state: bool,
    pub published: bool,
    pub persisted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub state: bool,
    pub published: usize,
    pub persisted: bool,
}

pub struct StateSynchronizer {
    relays: RelayBank<Ready>,
    store: PersistentStore,
}

impl StateSynchronizer {
    pub fn new(relays: RelayBank<Ready>, store: PersistentStore) -> Self {
        Self { relays, store }
    }

    pub fn store_mut(&mut self) -> &mut PersistentStore {
        &mut self.store
    }

    pub fn channel_count(&self) -> usize {
        self.relays.len()
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.relays.snapshot()
    }

    pub fn get_state(&self, index: usize) -> bool {
        self.relays.get_state(index)
    }

    /// Drives every channel to its stored state. Nothing is published or
    /// persisted; the broker gets the states on connect.
    pub fn restore(&mut self, states: &[bool]) {
        for (index, state) in states.iter().enumerate() {
            if let Err(e) = self.relays.set_state(index, *state) {
                warn!("Stored state for {} not restored: {}", index, e);
            }
        }
        info!(
            "Relay states restored ({} ON)",
            self.relays.states().iter().filter(|s| **s).count()
        );
    }

    pub fn apply_command(
        &mut self,
        index: usize,
        value: bool,
        origin: CommandOrigin,
        publisher: &mut dyn StatePublisher,
    ) -> Result<ApplyReport, RelayError> {
        self.relays.set_state(index, value)?;
        debug!("Applied {:?} command: relay {} -> {}", origin, index + 1, value);

        let published = publisher.publish_state(index, value);
        let persisted = self.persist();

        Ok(ApplyReport {
            index,
            state: value,
            published,
            persisted,
        })
    }

    pub fn toggle(
        &mut self,
        index: usize,
        origin: CommandOrigin,
        publisher: &mut dyn StatePublisher,
    ) -> Result<ApplyReport, RelayError> {
        if index >= self.relays.len() {
            return Err(RelayError::InvalidChannel(index));
        }
        let value = !self.relays.get_state(index);
        self.apply_command(index, value, origin, publisher)
    }

    /// Switches every channel, publishing each and persisting once.
    pub fn apply_all(&mut self, value: bool, publisher: &mut dyn StatePublisher) -> BulkReport {
        if value {
            self.relays.all_on();
        } else {
            self.relays.all_off();
        }

        let published = (0..self.relays.len())
            .filter(|index| publisher.publish_state(*index, value))
            .count();
        let persisted = self.persist();

        BulkReport {
            state: value,
            published,
            persisted,
        }
    }

    fn persist(&mut self) -> bool {
        match self.store.save_channel_states(&self.relays.states()) {
            Ok(()) => true,
            Err(e) => {
                warn!("Relay states not persisted, retrying on next change: {}", e);
                false
            }
        }
    }
}
