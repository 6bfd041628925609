//! # Push Dispatcher
//!
//! The `Dispatcher` is the delivery side of the gateway. Every live client
//! connection registers here and gets back the receiving half of an unbounded
//! channel; its socket task drains that channel onto the wire.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: A frame is wrapped in an `Arc` once and each
//!     recipient receives a pointer to the same allocation.
//!
//! 2.  **Named Groups**: Connections join and leave named groups. A group send
//!     reaches every current member; a connection send reaches one client.
//!
//! 3.  **Self-Cleaning**: A send that fails means the receiver was dropped, so
//!     the client is pruned on the spot.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// # Server Frame
///
/// The envelope written to a client socket: an event name plus its JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerFrame {
    /// Event name, e.g. `SystemStateUpdated` or `BroadcasterOnline`.
    pub event: String,
    /// Event payload. `null` for events without one.
    pub payload: Value,
}

impl ServerFrame {
    /// Serializes the envelope as a WebSocket text message body.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// # Push Channel
///
/// The seam the polling loop and the signaling registry push through. The
/// server wires the [`Dispatcher`]; tests substitute a recorder.
pub trait PushChannel: Send + Sync {
    /// Delivers `event` to every current member of `group`. Returns the number
    /// of connections reached.
    fn send_to_group(&self, group: &str, event: &str, payload: Value) -> usize;

    /// Delivers `event` to one connection. Returns `false` when the connection
    /// is unknown or gone.
    fn send_to_connection(&self, connection_id: &str, event: &str, payload: Value) -> bool;
}

struct ClientHandle {
    groups: HashSet<String>,
    sender: mpsc::UnboundedSender<Arc<ServerFrame>>,
}

/// # Core Dispatcher
///
/// Manages client registration, group membership and frame delivery.
#[derive(Default)]
pub struct Dispatcher {
    clients: Mutex<HashMap<String, ClientHandle>>,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, ClientHandle>> {
        // The map stays consistent even if a holder panicked mid-send.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Add Client
    ///
    /// Registers connection `id` and returns the receiver its socket task
    /// drains. Re-registering an id replaces the previous channel.
    pub fn add_client(&self, id: &str) -> mpsc::UnboundedReceiver<Arc<ServerFrame>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ClientHandle {
            groups: HashSet::new(),
            sender: tx,
        };
        self.clients().insert(id.to_string(), handle);
        tracing::debug!(connection_id = %id, "Client registered with dispatcher");
        rx
    }

    /// Removes a client and all of its group memberships.
    pub fn remove_client(&self, id: &str) {
        if self.clients().remove(id).is_some() {
            tracing::debug!(connection_id = %id, "Client removed from dispatcher");
        }
    }

    /// Adds connection `id` to `group`. Returns `false` for unknown connections.
    pub fn join_group(&self, id: &str, group: &str) -> bool {
        match self.clients().get_mut(id) {
            Some(client) => {
                client.groups.insert(group.to_string());
                true
            }
            None => false,
        }
    }

    /// Removes connection `id` from `group`. Unknown ids and non-members are a no-op.
    pub fn leave_group(&self, id: &str, group: &str) {
        if let Some(client) = self.clients().get_mut(id) {
            client.groups.remove(group);
        }
    }

    /// Number of registered connections.
    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// Number of connections currently in `group`.
    pub fn group_size(&self, group: &str) -> usize {
        self.clients()
            .values()
            .filter(|c| c.groups.contains(group))
            .count()
    }
}

impl PushChannel for Dispatcher {
    fn send_to_group(&self, group: &str, event: &str, payload: Value) -> usize {
        let frame = Arc::new(ServerFrame {
            event: event.to_string(),
            payload,
        });

        let mut delivered = 0;
        self.clients().retain(|id, client| {
            if !client.groups.contains(group) {
                return true;
            }
            match client.sender.send(Arc::clone(&frame)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    tracing::info!(connection_id = %id, "Client channel closed. Removing from dispatcher.");
                    false
                }
            }
        });
        delivered
    }

    fn send_to_connection(&self, connection_id: &str, event: &str, payload: Value) -> bool {
        let mut clients = self.clients();
        let Some(client) = clients.get(connection_id) else {
            return false;
        };
        let frame = Arc::new(ServerFrame {
            event: event.to_string(),
            payload,
        });
        if client.sender.send(frame).is_ok() {
            return true;
        }
        clients.remove(connection_id);
        tracing::info!(connection_id = %connection_id, "Client channel closed. Removing from dispatcher.");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_send_reaches_only_members() {
        let d = Dispatcher::new();
        let mut a = d.add_client("a");
        let mut b = d.add_client("b");
        assert!(d.join_group("a", "default"));

        let n = d.send_to_group("default", "SystemStateUpdated", json!({"k": 1}));

        assert_eq!(n, 1);
        let frame = a.try_recv().unwrap();
        assert_eq!(frame.event, "SystemStateUpdated");
        assert_eq!(frame.payload["k"], 1);
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn leaving_a_group_stops_delivery() {
        let d = Dispatcher::new();
        let mut a = d.add_client("a");
        d.join_group("a", "default");
        d.leave_group("a", "default");

        assert_eq!(d.send_to_group("default", "e", Value::Null), 0);
        assert!(a.try_recv().is_err());
        assert_eq!(d.group_size("default"), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let d = Dispatcher::new();
        let rx = d.add_client("gone");
        d.join_group("gone", "default");
        drop(rx);

        assert_eq!(d.send_to_group("default", "e", Value::Null), 0);
        assert_eq!(d.client_count(), 0);

        let rx = d.add_client("gone2");
        drop(rx);
        assert!(!d.send_to_connection("gone2", "e", Value::Null));
        assert_eq!(d.client_count(), 0);
    }

    #[test]
    fn connection_send_targets_one_client() {
        let d = Dispatcher::new();
        let mut a = d.add_client("a");
        let mut b = d.add_client("b");

        assert!(d.send_to_connection("b", "Signal", json!({"type": "offer"})));
        assert!(!d.send_to_connection("missing", "Signal", Value::Null));

        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap().event, "Signal");
    }

    #[test]
    fn frame_text_is_event_and_payload() {
        let frame = ServerFrame {
            event: "BroadcasterNotOnline".into(),
            payload: Value::Null,
        };
        let text = frame.to_text().unwrap();
        assert_eq!(text, r#"{"event":"BroadcasterNotOnline","payload":null}"#);
    }
}
