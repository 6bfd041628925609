//! # Connections Module
//!
//! Everything between the engine and the device proxy.
//!
//! ## Core Components:
//!
//! - **`device_source`**: the `DeviceStateSource` read/write capability the
//!   polling loop and the control endpoint depend on.
//!
//! - **`device_manager`**: the `ConnectionResilienceManager`, which owns the
//!   one live session and supervises reconnects.
//!
//! - **`session`**: the connector/session seam a wire protocol plugs into.
//!
//! - **`simulated`** and **`stub_source`**: in-process stand-ins for the proxy.

/// Device-proxy failure taxonomy.
pub mod error;
/// The read/write capability trait.
pub mod device_source;
/// Resilient session owner with background reconnect.
pub mod device_manager;
/// Transport seam: connectors and sessions.
pub mod session;
/// Simulated proxy used by the demo server and tests.
pub mod simulated;
/// Fixed-value source with no session.
pub mod stub_source;

pub use device_manager::ConnectionResilienceManager;
pub use device_source::DeviceStateSource;
pub use error::DeviceError;
pub use session::{DeviceSession, EndpointParams, ItemStatus, SessionConnector, TagReading};
pub use simulated::{SimulatedConnector, SimulatedDevice};
pub use stub_source::StubDeviceSource;
