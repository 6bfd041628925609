//! # Signaling Module
//!
//! Room bookkeeping for the peer handshake. Payloads are never parsed here;
//! they are relayed byte for byte between a room's broadcaster and viewers.

/// Handshake kinds and the pushes sent to participants.
pub mod messages;
/// The broadcaster/viewer room registry.
pub mod room_registry;

pub use messages::{SignalKind, SignalingEvent};
pub use room_registry::SignalingRoomRegistry;
