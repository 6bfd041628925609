use chrono::{DateTime, Utc};
use hub_common::signaling::SignalKind;
use serde::{Deserialize, Serialize};

/// Messages a state subscriber may send.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientMessage {
    pub join: Option<String>,
    pub leave: Option<String>,
}

/// Calls a signaling participant may make.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", rename_all_fields = "camelCase")]
pub enum SignalingRequest {
    JoinViewers {
        room_id: String,
    },
    LeaveViewers,
    RegisterBroadcaster {
        room_id: String,
    },
    Relay {
        room_id: String,
        #[serde(rename = "type")]
        kind: SignalKind,
        payload: String,
        #[serde(default)]
        target_id: Option<String>,
    },
    CheckBroadcaster {
        room_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub time_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_parses_with_and_without_target() {
        let msg: SignalingRequest = serde_json::from_str(
            r#"{"method":"Relay","roomId":"cell-1","type":"offer","payload":"v=0","targetId":"abc"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            SignalingRequest::Relay {
                room_id: "cell-1".into(),
                kind: SignalKind::Offer,
                payload: "v=0".into(),
                target_id: Some("abc".into()),
            }
        );

        let msg: SignalingRequest =
            serde_json::from_str(r#"{"method":"Relay","roomId":"cell-1","type":"ice","payload":"c"}"#).unwrap();
        assert!(matches!(msg, SignalingRequest::Relay { target_id: None, .. }));
    }

    #[test]
    fn unknown_methods_and_kinds_are_rejected() {
        assert!(serde_json::from_str::<SignalingRequest>(r#"{"method":"Kick","roomId":"x"}"#).is_err());
        assert!(serde_json::from_str::<SignalingRequest>(
            r#"{"method":"Relay","roomId":"x","type":"bye","payload":""}"#
        )
        .is_err());
    }

    #[test]
    fn state_client_messages() {
        let msg: ClientMessage = serde_json::from_str(r#"{"join":"line-2"}"#).unwrap();
        assert_eq!(msg.join.as_deref(), Some("line-2"));
        assert!(msg.leave.is_none());
    }
}
