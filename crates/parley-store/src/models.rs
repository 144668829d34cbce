//! Database row types mapping directly to SQLite rows, kept distinct from
//! the wire views in parley-types.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use parley_types::api::{MessageView, ReplyPreview};
use parley_types::models::{FileDescriptor, MessageKind};

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub group_id: i64,
    pub sender_id: i64,
    pub sender_username: String,
    pub kind: String,
    pub body: Option<String>,
    pub code_language: Option<String>,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub reply: Option<ReplyRow>,
    pub created_at: String,
    pub edited_at: Option<String>,
}

/// Resolved reply target, joined in by the message queries.
#[derive(Debug, Clone)]
pub struct ReplyRow {
    pub id: i64,
    pub content: String,
    pub sender_username: String,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: i64,
    pub name: String,
    pub is_private: bool,
    pub creator_id: i64,
}

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub group_id: i64,
    pub user_id: i64,
    pub is_admin: bool,
    pub is_acting_leader: bool,
}

/// A message about to be appended. The store allocates the id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub group_id: i64,
    pub sender_id: i64,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub code_language: Option<String>,
    pub file: Option<FileDescriptor>,
    pub reply_to: Option<i64>,
}

impl MessageRow {
    pub fn into_view(self) -> MessageView {
        let kind = MessageKind::parse(&self.kind).unwrap_or_else(|| {
            warn!("corrupt kind '{}' on message {}", self.kind, self.id);
            MessageKind::Text
        });
        let edited_at = self
            .edited_at
            .as_deref()
            .map(|raw| parse_timestamp(self.id, raw));
        MessageView {
            id: self.id,
            group_id: self.group_id,
            sender_id: self.sender_id,
            sender_username: self.sender_username,
            kind,
            content: self.body,
            code_language: self.code_language,
            file_name: self.file_name,
            file_path: self.file_path,
            reply_to: self.reply.map(|r| ReplyPreview {
                id: r.id,
                content: r.content,
                sender_username: r.sender_username,
            }),
            created_at: parse_timestamp(self.id, &self.created_at),
            edited_at,
        }
    }
}

/// SQLite stores timestamps as "YYYY-MM-DD HH:MM:SS" without timezone.
/// Parse as naive UTC and convert; RFC 3339 values pass through unchanged.
fn parse_timestamp(message_id: i64, raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("corrupt timestamp '{}' on message {}: {}", raw, message_id, e);
            DateTime::default()
        })
}
