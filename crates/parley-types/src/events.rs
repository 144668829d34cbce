use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::MessageView;
use crate::models::MessageKind;

/// Envelopes sent server -> client over a live group connection. The wire
/// shape is flat JSON with a `type` discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Someone else's connection was registered in the group.
    UserJoined {
        user_id: i64,
        timestamp: DateTime<Utc>,
    },

    /// A connection left the group for good.
    UserLeft {
        user_id: i64,
        timestamp: DateTime<Utc>,
    },

    /// Full snapshot of who is typing, sender included. Clients reconcile
    /// against the set rather than applying deltas.
    TypingUpdate {
        typing_users: Vec<i64>,
        timestamp: DateTime<Utc>,
    },

    /// A message was persisted and is being fanned out, sender included.
    NewMessage {
        message: MessageView,
        timestamp: DateTime<Utc>,
    },

    /// Delivered to the offending client only, never broadcast.
    Error { message: String },
}

/// Envelopes sent client -> server. Anything with an unrecognized `type`
/// is dropped by the session, not treated as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Message {
        content: String,
        message_type: MessageKind,
        #[serde(default)]
        code_language: Option<String>,
        #[serde(default)]
        reply_to_id: Option<i64>,
    },

    Typing { is_typing: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_envelopes_are_flat_with_a_type_tag() {
        let event = ServerEvent::UserJoined {
            user_id: 9,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "user_joined");
        assert_eq!(value["user_id"], 9);
        assert!(value["timestamp"].is_string());

        let event = ServerEvent::TypingUpdate {
            typing_users: vec![1, 2],
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "typing_update");
        assert_eq!(value["typing_users"], serde_json::json!([1, 2]));
    }

    #[test]
    fn inbound_message_envelope_parses() {
        let raw = r#"{"type":"message","content":"hi","message_type":"code","code_language":"rust","reply_to_id":null}"#;
        match serde_json::from_str::<ClientCommand>(raw).unwrap() {
            ClientCommand::Message {
                content,
                message_type,
                code_language,
                reply_to_id,
            } => {
                assert_eq!(content, "hi");
                assert_eq!(message_type, MessageKind::Code);
                assert_eq!(code_language.as_deref(), Some("rust"));
                assert_eq!(reply_to_id, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn inbound_typing_envelope_parses_and_optionals_default() {
        let raw = r#"{"type":"typing","is_typing":true}"#;
        assert!(matches!(
            serde_json::from_str::<ClientCommand>(raw).unwrap(),
            ClientCommand::Typing { is_typing: true }
        ));

        // message with the optional fields left out entirely
        let raw = r#"{"type":"message","content":"hello","message_type":"text"}"#;
        match serde_json::from_str::<ClientCommand>(raw).unwrap() {
            ClientCommand::Message {
                code_language,
                reply_to_id,
                ..
            } => {
                assert_eq!(code_language, None);
                assert_eq!(reply_to_id, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn unrecognized_envelope_kinds_fail_to_parse() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"presence_probe"}"#).is_err());
    }
}
