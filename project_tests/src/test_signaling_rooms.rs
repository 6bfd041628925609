use std::sync::Arc;

use hub_common::core::ServerFrame;
use hub_common::signaling::SignalKind;
use hub_common::{Dispatcher, SignalingRoomRegistry};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

type Inbox = UnboundedReceiver<Arc<ServerFrame>>;

fn setup() -> (Arc<Dispatcher>, SignalingRoomRegistry) {
    let dispatcher = Arc::new(Dispatcher::new());
    let registry = SignalingRoomRegistry::new(dispatcher.clone());
    (dispatcher, registry)
}

fn drain(rx: &mut Inbox) -> Vec<Arc<ServerFrame>> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn events(rx: &mut Inbox) -> Vec<(String, Value)> {
    drain(rx)
        .into_iter()
        .map(|f| (f.event.clone(), f.payload.clone()))
        .collect()
}

fn id(value: &str) -> Value {
    serde_json::json!({ "id": value })
}

#[test]
fn viewer_and_broadcaster_complete_a_handshake() {
    let (dispatcher, rooms) = setup();
    let mut v1 = dispatcher.add_client("v1");
    let mut v2 = dispatcher.add_client("v2");
    let mut b1 = dispatcher.add_client("b1");

    // Joining an empty room is silent.
    rooms.join_viewers("cell-1", "v1");
    assert!(events(&mut v1).is_empty());

    rooms.register_broadcaster("cell-1", "b1");
    assert_eq!(events(&mut v1), vec![("BroadcasterOnline".to_string(), id("b1"))]);

    rooms.join_viewers("cell-1", "v2");
    assert_eq!(events(&mut v2), vec![("BroadcasterOnline".to_string(), id("b1"))]);
    assert_eq!(events(&mut b1), vec![("ViewerJoined".to_string(), id("v2"))]);

    let sdp = "v=0\r\no=- 46117 2 IN IP4 127.0.0.1\r\n";
    assert_eq!(rooms.relay("cell-1", "b1", SignalKind::Offer, sdp, Some("v2")), 1);
    let offer = drain(&mut v2);
    assert_eq!(offer.len(), 1);
    assert_eq!(offer[0].event, "Signal");
    assert_eq!(offer[0].payload["type"], "offer");
    assert_eq!(offer[0].payload["payload"], sdp);
    assert_eq!(offer[0].payload["fromId"], "b1");
    assert!(drain(&mut v1).is_empty());

    assert_eq!(rooms.relay("cell-1", "v2", SignalKind::Answer, "answer-sdp", Some("b1")), 1);
    let answer = drain(&mut b1);
    assert_eq!(answer[0].payload["fromId"], "v2");

    // Untargeted relays reach every viewer but the sender.
    assert_eq!(rooms.relay("cell-1", "b1", SignalKind::Ice, "candidate", None), 2);
    assert_eq!(drain(&mut v1).len(), 1);
    assert_eq!(drain(&mut v2).len(), 1);
    assert!(drain(&mut b1).is_empty());
}

#[test]
fn broadcaster_disconnect_is_visible_to_later_checks() {
    let (dispatcher, rooms) = setup();
    let mut v1 = dispatcher.add_client("v1");
    let _b1 = dispatcher.add_client("b1");

    rooms.register_broadcaster("cell-1", "b1");
    rooms.join_viewers("cell-1", "v1");
    drain(&mut v1);

    rooms.on_disconnected("b1");
    dispatcher.remove_client("b1");

    rooms.check_broadcaster("cell-1", "v1");
    assert_eq!(events(&mut v1), vec![("BroadcasterNotOnline".to_string(), Value::Null)]);
    assert_eq!(rooms.broadcaster_of("cell-1"), None);
    assert_eq!(rooms.viewers_of("cell-1"), vec!["v1".to_string()]);
}

#[test]
fn newer_broadcaster_survives_the_old_one_disconnecting() {
    let (_dispatcher, rooms) = setup();

    rooms.register_broadcaster("cell-1", "b1");
    rooms.register_broadcaster("cell-1", "b2");
    rooms.on_disconnected("b1");

    assert_eq!(rooms.broadcaster_of("cell-1").as_deref(), Some("b2"));
}

#[test]
fn switching_rooms_notifies_both_broadcasters() {
    let (dispatcher, rooms) = setup();
    let mut ba = dispatcher.add_client("ba");
    let mut bb = dispatcher.add_client("bb");
    let _v = dispatcher.add_client("v");

    rooms.register_broadcaster("room-a", "ba");
    rooms.register_broadcaster("room-b", "bb");
    rooms.join_viewers("room-a", "v");
    drain(&mut ba);

    rooms.join_viewers("room-b", "v");

    assert_eq!(events(&mut ba), vec![("ViewerLeft".to_string(), id("v"))]);
    assert_eq!(events(&mut bb), vec![("ViewerJoined".to_string(), id("v"))]);
    assert!(rooms.viewers_of("room-a").is_empty());
    assert_eq!(rooms.viewers_of("room-b"), vec!["v".to_string()]);
}

#[test]
fn relay_to_an_unknown_target_reaches_nobody() {
    let (dispatcher, rooms) = setup();
    let _b1 = dispatcher.add_client("b1");
    rooms.register_broadcaster("cell-1", "b1");

    assert_eq!(rooms.relay("cell-1", "b1", SignalKind::Offer, "x", Some("ghost")), 0);
    assert_eq!(rooms.relay("cell-1", "b1", SignalKind::Ice, "x", None), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_and_disconnects_leave_consistent_rooms() {
    let (_dispatcher, rooms) = setup();
    let rooms = Arc::new(rooms);
    let room_names = ["r0", "r1", "r2", "r3"];

    let mut tasks = Vec::new();
    for i in 0..64 {
        let rooms = rooms.clone();
        let room = room_names[i % room_names.len()];
        tasks.push(tokio::spawn(async move {
            rooms.join_viewers(room, &format!("viewer-{i}"));
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    for room in room_names {
        assert_eq!(rooms.viewers_of(room).len(), 16);
    }

    let mut tasks = Vec::new();
    for i in 0..64 {
        let rooms = rooms.clone();
        tasks.push(tokio::spawn(async move {
            rooms.on_disconnected(&format!("viewer-{i}"));
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    for room in room_names {
        assert!(rooms.viewers_of(room).is_empty());
    }
    // Containers stay around after their last member leaves.
    assert_eq!(rooms.room_count(), 4);
}
