use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind of handshake message being relayed. Anything else is rejected before
/// it reaches the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pushes sent to signaling participants.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    BroadcasterOnline { id: String },
    BroadcasterNotOnline,
    ViewerJoined { id: String },
    ViewerLeft { id: String },
    Signal {
        kind: SignalKind,
        payload: String,
        from_id: String,
    },
}

impl SignalingEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalingEvent::BroadcasterOnline { .. } => "BroadcasterOnline",
            SignalingEvent::BroadcasterNotOnline => "BroadcasterNotOnline",
            SignalingEvent::ViewerJoined { .. } => "ViewerJoined",
            SignalingEvent::ViewerLeft { .. } => "ViewerLeft",
            SignalingEvent::Signal { .. } => "Signal",
        }
    }

    /// JSON payload of the push. The relayed `payload` string is carried as-is.
    pub fn payload(&self) -> Value {
        match self {
            SignalingEvent::BroadcasterOnline { id }
            | SignalingEvent::ViewerJoined { id }
            | SignalingEvent::ViewerLeft { id } => json!({ "id": id }),
            SignalingEvent::BroadcasterNotOnline => Value::Null,
            SignalingEvent::Signal {
                kind,
                payload,
                from_id,
            } => json!({
                "type": kind.as_str(),
                "payload": payload,
                "fromId": from_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_payload_keeps_the_body_verbatim() {
        let body = r#"{"sdp":"v=0\r\no=- 46117 2 IN IP4 127.0.0.1"}"#;
        let event = SignalingEvent::Signal {
            kind: SignalKind::Offer,
            payload: body.to_string(),
            from_id: "b-1".to_string(),
        };

        let value = event.payload();

        assert_eq!(event.event_name(), "Signal");
        assert_eq!(value["type"], "offer");
        assert_eq!(value["payload"].as_str(), Some(body));
        assert_eq!(value["fromId"], "b-1");
    }

    #[test]
    fn kinds_parse_lowercase_only() {
        assert_eq!(serde_json::from_str::<SignalKind>(r#""ice""#).unwrap(), SignalKind::Ice);
        assert!(serde_json::from_str::<SignalKind>(r#""bye""#).is_err());
    }
}
