//! Client → Server messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server.
///
/// `session_id` is always optional and advisory: when present it overrides
/// the session bound to the connection at connect time, when absent the
/// bound session is used. Resolution order is fixed: event override,
/// then connection-bound id, then rejection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A visitor chat turn
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },

    /// Keep-alive; refreshes last-activity and forces the session active
    Heartbeat {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Explicitly close the session
    EndSession {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::ClientMessage;

    #[test]
    fn deserializes_message_with_metadata() {
        let json = r#"{
          "type":"message",
          "session_id":"sess-1",
          "content":"hi there",
          "metadata":{"page":"/pricing"}
        }"#;

        let parsed: ClientMessage = serde_json::from_str(json).expect("parse message");
        match parsed {
            ClientMessage::Message {
                session_id,
                content,
                metadata,
            } => {
                assert_eq!(session_id.as_deref(), Some("sess-1"));
                assert_eq!(content, "hi there");
                let page = metadata
                    .and_then(|m| m.get("page").and_then(|v| v.as_str()).map(str::to_string));
                assert_eq!(page.as_deref(), Some("/pricing"));
            }
            other => panic!("unexpected message variant: {:?}", other),
        }
    }

    #[test]
    fn message_without_session_id_defaults_to_none() {
        let json = r#"{"type":"message","content":"hello"}"#;

        let parsed: ClientMessage = serde_json::from_str(json).expect("parse message");
        match parsed {
            ClientMessage::Message {
                session_id,
                metadata,
                ..
            } => {
                assert!(session_id.is_none());
                assert!(metadata.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn roundtrip_heartbeat() {
        let json = r#"{"type":"heartbeat"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).expect("parse heartbeat");
        match &parsed {
            ClientMessage::Heartbeat { session_id } => assert!(session_id.is_none()),
            other => panic!("unexpected variant: {:?}", other),
        }

        let serialized = serde_json::to_string(&parsed).expect("serialize");
        let _: ClientMessage = serde_json::from_str(&serialized).expect("reparse");
    }

    #[test]
    fn roundtrip_end_session() {
        let json = r#"{"type":"end_session","session_id":"sess-9"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).expect("parse end_session");
        match &parsed {
            ClientMessage::EndSession { session_id } => {
                assert_eq!(session_id.as_deref(), Some("sess-9"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let serialized = serde_json::to_string(&parsed).expect("serialize");
        let _: ClientMessage = serde_json::from_str(&serialized).expect("roundtrip");
    }
}
