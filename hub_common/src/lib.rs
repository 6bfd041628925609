//! # hub_common
//!
//! Core engine of the ControlHub gateway. Each folder is a feature-gated module
//! (see `Cargo.toml`), mirroring how the gateway is wired at runtime:
//!
//! - **`connections`**: the resilient session to the device proxy.
//! - **`core`**: the state snapshot, its lock-free aggregator and the push hub.
//! - **`ingestors`**: the polling loop that feeds the aggregator and fans out.
//! - **`signaling`**: broadcaster/viewer rooms for the peer handshake relay.
//! - **`configs`**: typed settings with defaults and validation.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
#[cfg(feature = "signaling")]
pub mod signaling;

// Re-export the types the server binary touches most.
#[cfg(feature = "configs")]
pub use configs::config_hub::{ConfigurationError, DeviceSettings, HubSettings, PollingSettings};
#[cfg(feature = "connections")]
pub use connections::{ConnectionResilienceManager, DeviceError, DeviceStateSource};
#[cfg(feature = "core")]
pub use crate::core::{Dispatcher, ExtensionValue, PushChannel, Snapshot, StateAggregator};
#[cfg(feature = "ingestors")]
pub use ingestors::StatePollingLoop;
#[cfg(feature = "signaling")]
pub use signaling::SignalingRoomRegistry;
