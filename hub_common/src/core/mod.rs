//! # Core Engine Module
//!
//! The state side of the gateway. Everything here is in-memory, thread-safe and
//! free of device I/O.
//!
//! ## Core Components:
//!
//! - **`snapshot`**: the immutable `Snapshot` value and its tagged
//!   `ExtensionValue` bag, plus the merge rule used on every poll tick.
//!
//! - **`aggregator`**: the `StateAggregator`, a single atomically swapped
//!   reference to the current snapshot. Readers never block; writers retry
//!   optimistically when they lose a compare-and-swap.
//!
//! - **`dispatcher`**: the push hub. It keeps one unbounded channel per live
//!   connection plus the connection's group memberships, and delivers frames
//!   either to a whole group or to one connection.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Lock-free holder of the current snapshot.
pub mod aggregator;
/// Group-addressed and connection-addressed push hub.
pub mod dispatcher;
/// Snapshot value type and extension merge rules.
pub mod snapshot;

// --- Public API Re-exports ---
pub use aggregator::StateAggregator;
pub use dispatcher::{Dispatcher, PushChannel, ServerFrame};
pub use snapshot::{ExtensionMap, ExtensionValue, Snapshot};
