//! # Data Ingestors Module
//!
//! Tasks that pull data into the engine. The gateway has one source today:
//! the device proxy, polled on a fixed cadence.
//!
//! ## Contained Modules:
//! - **`state_polling`**: the polling and broadcast loop feeding the
//!   `StateAggregator` and fanning snapshots out to the default group.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The device state polling and broadcast loop.
pub mod state_polling;

// --- Public API Re-exports ---
pub use state_polling::{PollError, PollStats, StatePollingLoop, DEFAULT_GROUP, STATE_EVENT};
