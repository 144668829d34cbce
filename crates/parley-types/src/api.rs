use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::MessageKind;

// -- Bearer token claims --

/// Claims shared by the REST middleware and the websocket handshake.
/// `sub` carries the username issued by the external account service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

// -- Message views --

/// A message as clients see it, both in `new_message` envelopes and in
/// history responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub group_id: i64,
    pub sender_id: i64,
    pub sender_username: String,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub code_language: Option<String>,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub reply_to: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// Summary of the message a reply points at: enough for the client to
/// render a quote line without another lookup. `content` falls back to the
/// file name for file-kind targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub id: i64,
    pub content: String,
    pub sender_username: String,
}

// -- History --

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<MessageView>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}
