//! # Broker Integration Module
//!
//! Keeps one logical session to the home automation broker and maps the
//! relay bank onto it: a command topic and a retained state topic per
//! channel, a retained availability topic backed by a last will, and
//! discovery configs so the hub picks the channels up on its own.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker credentials and per-session options
//! ├── discovery.rs        - Discovery payloads
//! ├── message_manager.rs  - Message types and payload vocabulary
//! ├── mqtt_handler.rs     - Session lifecycle: connect, subscribe, publish
//! ├── topics.rs           - Topic layout
//! └── transport.rs        - Transport seam and the rumqttc adapter
//! ```
//!
//! ## Session Lifecycle
//!
//! Connection attempts are only made while the station link is up and at
//! most once per retry interval. Failures are retried for the life of the
//! process, without backoff. Discovery goes out once per boot; channel
//! states are republished after every (re)connect.

pub mod config;
pub mod discovery;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topics;
pub mod transport;
