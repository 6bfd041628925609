//! # Signaling Room Registry
//!
//! Brokers one broadcaster and many viewers per room and relays their opaque
//! handshake messages. The registry is an owned object: the server builds one
//! and injects it into the signaling socket handlers.
//!
//! ## Maps
//!
//! - `broadcasters`: room → broadcaster connection id (last write wins).
//! - `viewer_rooms`: viewer connection id → room, for O(1) disconnect cleanup.
//! - `room_viewers`: room → viewer connection ids, the relay audience.
//!
//! Each map is independently concurrent and no lock spans two of them. No map
//! guard is held while pushing.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use super::messages::{SignalKind, SignalingEvent};
use crate::core::PushChannel;

/// # Signaling Room Registry
pub struct SignalingRoomRegistry {
    push: Arc<dyn PushChannel>,
    broadcasters: DashMap<String, String>,
    viewer_rooms: DashMap<String, String>,
    room_viewers: DashMap<String, HashSet<String>>,
}

impl SignalingRoomRegistry {
    pub fn new(push: Arc<dyn PushChannel>) -> Self {
        Self {
            push,
            broadcasters: DashMap::new(),
            viewer_rooms: DashMap::new(),
            room_viewers: DashMap::new(),
        }
    }

    fn notify(&self, connection_id: &str, event: SignalingEvent) -> bool {
        let delivered = self
            .push
            .send_to_connection(connection_id, event.event_name(), event.payload());
        if !delivered {
            tracing::trace!(connection_id = %connection_id, event = event.event_name(), "Signaling push missed");
        }
        delivered
    }

    /// # Join Viewers
    ///
    /// Adds `caller` to the viewers of `room_id`, moving it out of any room it
    /// was viewing before. When the room has a broadcaster, the caller learns
    /// its id and the broadcaster learns about the caller.
    ///
    /// Calls for one connection must be serialized by the caller: the two
    /// membership maps are updated separately, so a join racing that same
    /// connection's `on_disconnected` can leave its id behind in the room. The
    /// socket handler processes one message at a time and runs the disconnect
    /// hook only after its loop ends.
    pub fn join_viewers(&self, room_id: &str, caller: &str) {
        let previous = self
            .viewer_rooms
            .insert(caller.to_string(), room_id.to_string());
        if let Some(previous) = previous.filter(|p| p != room_id) {
            self.drop_viewer(&previous, caller);
        }

        self.room_viewers
            .entry(room_id.to_string())
            .or_default()
            .insert(caller.to_string());
        tracing::debug!(room_id = %room_id, connection_id = %caller, "Viewer joined room");

        if let Some(broadcaster) = self.broadcaster_of(room_id) {
            self.notify(caller, SignalingEvent::BroadcasterOnline { id: broadcaster.clone() });
            self.notify(&broadcaster, SignalingEvent::ViewerJoined { id: caller.to_string() });
        }
    }

    /// # Register Broadcaster
    ///
    /// Makes `caller` the broadcaster of `room_id` and tells every current
    /// viewer. An existing broadcaster is replaced without notice.
    pub fn register_broadcaster(&self, room_id: &str, caller: &str) {
        let displaced = self
            .broadcasters
            .insert(room_id.to_string(), caller.to_string());
        match displaced {
            Some(old) if old != caller => {
                tracing::debug!(room_id = %room_id, old = %old, new = %caller, "Broadcaster replaced");
            }
            _ => tracing::debug!(room_id = %room_id, connection_id = %caller, "Broadcaster registered"),
        }

        for viewer in self.viewers_of(room_id) {
            self.notify(&viewer, SignalingEvent::BroadcasterOnline { id: caller.to_string() });
        }
    }

    /// # Relay
    ///
    /// Forwards an opaque handshake message. With a target it goes to exactly
    /// that connection; without one it goes to every viewer of the room except
    /// the sender. Returns the number of connections reached. Unknown targets
    /// are not an error.
    pub fn relay(
        &self,
        room_id: &str,
        caller: &str,
        kind: SignalKind,
        payload: &str,
        target: Option<&str>,
    ) -> usize {
        let event = SignalingEvent::Signal {
            kind,
            payload: payload.to_string(),
            from_id: caller.to_string(),
        };

        match target {
            Some(target) => usize::from(self.notify(target, event)),
            None => self
                .viewers_of(room_id)
                .iter()
                .filter(|viewer| viewer.as_str() != caller)
                .filter(|viewer| self.notify(viewer, event.clone()))
                .count(),
        }
    }

    /// # Check Broadcaster
    ///
    /// Tells `caller` whether `room_id` currently has a broadcaster.
    pub fn check_broadcaster(&self, room_id: &str, caller: &str) {
        let event = match self.broadcaster_of(room_id) {
            Some(id) => SignalingEvent::BroadcasterOnline { id },
            None => SignalingEvent::BroadcasterNotOnline,
        };
        self.notify(caller, event);
    }

    /// Removes `caller` from whatever room it is viewing and tells that room's
    /// broadcaster. A no-op for connections that view nothing.
    pub fn leave_viewers(&self, caller: &str) {
        if let Some((_, room_id)) = self.viewer_rooms.remove(caller) {
            self.drop_viewer(&room_id, caller);
        }
    }

    /// # On Disconnected
    ///
    /// Transport hook for a closed connection. Clears broadcaster entries still
    /// held by `caller` and its viewer membership. Safe to call repeatedly.
    pub fn on_disconnected(&self, caller: &str) {
        // Only entries that still point at the caller; a newer registration wins.
        self.broadcasters.retain(|room_id, broadcaster| {
            let keep = broadcaster.as_str() != caller;
            if !keep {
                tracing::debug!(room_id = %room_id, connection_id = %caller, "Broadcaster disconnected");
            }
            keep
        });
        self.leave_viewers(caller);
    }

    fn drop_viewer(&self, room_id: &str, caller: &str) {
        if let Some(mut viewers) = self.room_viewers.get_mut(room_id) {
            viewers.remove(caller);
        }
        tracing::debug!(room_id = %room_id, connection_id = %caller, "Viewer left room");

        if let Some(broadcaster) = self.broadcaster_of(room_id) {
            self.notify(&broadcaster, SignalingEvent::ViewerLeft { id: caller.to_string() });
        }
    }

    /// Current broadcaster of `room_id`.
    pub fn broadcaster_of(&self, room_id: &str) -> Option<String> {
        self.broadcasters.get(room_id).map(|entry| entry.value().clone())
    }

    /// Current viewers of `room_id`, copied out of the map.
    pub fn viewers_of(&self, room_id: &str) -> Vec<String> {
        self.room_viewers
            .get(room_id)
            .map(|viewers| viewers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of room containers ever created. Containers are never pruned.
    pub fn room_count(&self) -> usize {
        let mut rooms: HashSet<String> = self.room_viewers.iter().map(|e| e.key().clone()).collect();
        rooms.extend(self.broadcasters.iter().map(|e| e.key().clone()));
        rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Dispatcher, ServerFrame};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (Arc<Dispatcher>, SignalingRoomRegistry) {
        let dispatcher = Arc::new(Dispatcher::new());
        let registry = SignalingRoomRegistry::new(dispatcher.clone());
        (dispatcher, registry)
    }

    fn drain(rx: &mut UnboundedReceiver<Arc<ServerFrame>>) -> Vec<Arc<ServerFrame>> {
        let mut frames = Vec::new();
        while let Ok(f) = rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    #[test]
    fn join_after_register_notifies_both_sides() {
        let (d, reg) = setup();
        let mut b = d.add_client("B");
        let mut v = d.add_client("V");

        reg.register_broadcaster("cell-1", "B");
        reg.join_viewers("cell-1", "V");

        let to_v = drain(&mut v);
        assert_eq!(to_v.len(), 1);
        assert_eq!(to_v[0].event, "BroadcasterOnline");
        assert_eq!(to_v[0].payload["id"], "B");

        let to_b = drain(&mut b);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].event, "ViewerJoined");
        assert_eq!(to_b[0].payload["id"], "V");
    }

    #[test]
    fn register_notifies_waiting_viewers() {
        let (d, reg) = setup();
        let mut v1 = d.add_client("V1");
        let mut v2 = d.add_client("V2");
        reg.join_viewers("cell-1", "V1");
        reg.join_viewers("cell-1", "V2");
        assert!(drain(&mut v1).is_empty());

        reg.register_broadcaster("cell-1", "B");

        assert_eq!(drain(&mut v1)[0].payload["id"], "B");
        assert_eq!(drain(&mut v2)[0].event, "BroadcasterOnline");
    }

    #[test]
    fn untargeted_relay_skips_the_sender() {
        let (d, reg) = setup();
        let mut v1 = d.add_client("V1");
        let mut v2 = d.add_client("V2");
        reg.join_viewers("cell-1", "V1");
        reg.join_viewers("cell-1", "V2");

        let n = reg.relay("cell-1", "V1", SignalKind::Ice, "candidate:1", None);

        assert_eq!(n, 1);
        assert!(drain(&mut v1).is_empty());
        let got = drain(&mut v2);
        assert_eq!(got[0].payload["payload"], "candidate:1");
        assert_eq!(got[0].payload["fromId"], "V1");
    }

    #[test]
    fn targeted_relay_to_unknown_connection_is_silent() {
        let (d, reg) = setup();
        let mut b = d.add_client("B");

        assert_eq!(reg.relay("cell-1", "V", SignalKind::Answer, "sdp", Some("ghost")), 0);
        assert_eq!(reg.relay("cell-1", "V", SignalKind::Answer, "sdp", Some("B")), 1);
        assert_eq!(drain(&mut b)[0].payload["type"], "answer");
    }

    #[test]
    fn broadcaster_disconnect_clears_the_room() {
        let (d, reg) = setup();
        let mut v = d.add_client("V");
        reg.register_broadcaster("cell-1", "B");

        reg.on_disconnected("B");
        reg.check_broadcaster("cell-1", "V");

        let got = drain(&mut v);
        assert_eq!(got[0].event, "BroadcasterNotOnline");
        assert!(reg.broadcaster_of("cell-1").is_none());
    }

    #[test]
    fn stale_disconnect_keeps_the_newer_broadcaster() {
        let (_d, reg) = setup();
        reg.register_broadcaster("cell-1", "B1");
        reg.register_broadcaster("cell-1", "B2");

        reg.on_disconnected("B1");

        assert_eq!(reg.broadcaster_of("cell-1").as_deref(), Some("B2"));
    }

    #[test]
    fn viewer_disconnect_tells_the_broadcaster_once() {
        let (d, reg) = setup();
        let mut b = d.add_client("B");
        reg.register_broadcaster("cell-1", "B");
        reg.join_viewers("cell-1", "V");
        drain(&mut b);

        reg.on_disconnected("V");
        reg.on_disconnected("V");

        let got = drain(&mut b);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event, "ViewerLeft");
        assert!(reg.viewers_of("cell-1").is_empty());
        // The container outlives its members.
        assert_eq!(reg.room_count(), 1);
    }

    #[test]
    fn rejoining_moves_the_viewer() {
        let (d, reg) = setup();
        let mut b1 = d.add_client("B1");
        reg.register_broadcaster("cell-1", "B1");
        reg.join_viewers("cell-1", "V");
        reg.join_viewers("cell-2", "V");

        assert!(reg.viewers_of("cell-1").is_empty());
        assert_eq!(reg.viewers_of("cell-2"), vec!["V".to_string()]);
        let events: Vec<_> = drain(&mut b1).iter().map(|f| f.event.clone()).collect();
        assert_eq!(events, vec!["ViewerJoined", "ViewerLeft"]);
    }

    #[test]
    fn ordered_calls_for_one_connection_leave_no_orphans() {
        let (_d, reg) = setup();

        reg.join_viewers("room-a", "V");
        reg.join_viewers("room-b", "V");
        reg.on_disconnected("V");
        reg.join_viewers("room-a", "V");
        reg.leave_viewers("V");
        reg.on_disconnected("V");

        assert!(reg.viewers_of("room-a").is_empty());
        assert!(reg.viewers_of("room-b").is_empty());
        assert!(reg.viewer_rooms.get("V").is_none());
    }
}
