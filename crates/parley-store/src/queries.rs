use rusqlite::{Connection, OptionalExtension, params};

use parley_types::models::MessageKind;

use crate::models::{GroupRow, MemberRow, MessageRow, NewMessage, ReplyRow, UserRow};
use crate::{Database, StoreError, StoreResult};

/// Hard cap on page and search sizes; also the initial-room-load default.
pub const MAX_PAGE_LIMIT: u32 = 50;
/// Default size for incremental scroll-back pages.
pub const SCROLL_PAGE_LIMIT: u32 = 20;

impl Database {
    // -- Messages --

    /// Appends a message, allocating the next global id. Rejects a body on
    /// file messages, a missing body everywhere else, and a reply target
    /// that does not exist in the same group.
    pub fn append(&self, new: NewMessage) -> StoreResult<MessageRow> {
        self.with_conn(|conn| {
            validate_draft(conn, &new)?;
            let (file_name, file_path) = match &new.file {
                Some(f) => (Some(f.name.as_str()), Some(f.path.as_str())),
                None => (None, None),
            };
            conn.execute(
                "INSERT INTO messages (group_id, sender_id, kind, body, code_language, file_name, file_path, reply_to_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.group_id,
                    new.sender_id,
                    new.kind.as_str(),
                    new.body,
                    new.code_language,
                    file_name,
                    file_path,
                    new.reply_to
                ],
            )?;
            let id = conn.last_insert_rowid();
            query_message(conn, id)?.ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        })
    }

    pub fn get(&self, message_id: i64) -> StoreResult<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, message_id))
    }

    /// One page of a group's log, newest first. `before` is an exclusive
    /// upper bound on the id, which keeps cursors stable under concurrent
    /// appends; callers reverse the page for chronological display.
    pub fn page(&self, group_id: i64, before: Option<i64>, limit: u32) -> StoreResult<Vec<MessageRow>> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.group_id = ?1 AND (?2 IS NULL OR m.id < ?2)
                 ORDER BY m.id DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![group_id, before, limit], map_message_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Edits a message body and stamps the edit time. Editing a message
    /// that never existed (or a file message, which has no body) is a
    /// silent no-op reported as `None`; callers must check.
    pub fn edit(&self, message_id: i64, new_body: &str) -> StoreResult<Option<MessageRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET body = ?2, edited_at = datetime('now')
                 WHERE id = ?1 AND kind != 'file'",
                params![message_id, new_body],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_message(conn, message_id)
        })
    }

    pub fn delete(&self, message_id: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM messages WHERE id = ?1", [message_id])?;
            Ok(removed > 0)
        })
    }

    /// Case-insensitive substring search over body text. An empty query
    /// matches nothing rather than everything.
    pub fn search(&self, group_id: i64, query: &str, limit: u32) -> StoreResult<Vec<MessageRow>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let pattern = escape_like(query);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.group_id = ?1 AND m.body LIKE '%' || ?2 || '%' ESCAPE '\\'
                 ORDER BY m.id DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![group_id, pattern, limit], map_message_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Directory reads (accounts and groups are written by external services) --

    pub fn user_by_username(&self, username: &str) -> StoreResult<Option<UserRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, is_active FROM users WHERE username = ?1",
                    [username],
                    |row| {
                        Ok(UserRow {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            is_active: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn group(&self, group_id: i64) -> StoreResult<Option<GroupRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, is_private, creator_id FROM groups WHERE id = ?1",
                    [group_id],
                    |row| {
                        Ok(GroupRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            is_private: row.get(2)?,
                            creator_id: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn membership(&self, group_id: i64, user_id: i64) -> StoreResult<Option<MemberRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT group_id, user_id, is_admin, is_acting_leader
                     FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                    params![group_id, user_id],
                    |row| {
                        Ok(MemberRow {
                            group_id: row.get(0)?,
                            user_id: row.get(1)?,
                            is_admin: row.get(2)?,
                            is_acting_leader: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn is_member(&self, group_id: i64, user_id: i64) -> StoreResult<bool> {
        Ok(self.membership(group_id, user_id)?.is_some())
    }

    /// Health probe: one round trip through the connection.
    pub fn ping(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    // -- Write surface consumed by the account/admin collaborators --

    pub fn create_user(&self, username: &str, email: &str, password_hash: &str) -> StoreResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, email, password_hash) VALUES (?1, ?2, ?3)",
                params![username, email, password_hash],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn create_group(&self, name: &str, creator_id: i64, is_private: bool) -> StoreResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO groups (name, creator_id, is_private) VALUES (?1, ?2, ?3)",
                params![name, creator_id, is_private],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn add_member(&self, group_id: i64, user_id: i64, is_admin: bool) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO group_members (group_id, user_id, is_admin) VALUES (?1, ?2, ?3)",
                params![group_id, user_id, is_admin],
            )?;
            Ok(())
        })
    }

    pub fn remove_member(&self, group_id: i64, user_id: i64) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
            )?;
            Ok(removed > 0)
        })
    }
}

// JOIN users for the sender name and self-join for the reply preview in a
// single query (eliminates N+1 on the history path).
const MESSAGE_SELECT: &str = "
    SELECT m.id, m.group_id, m.sender_id, u.username,
           m.kind, m.body, m.code_language, m.file_name, m.file_path,
           m.created_at, m.edited_at,
           r.id, COALESCE(r.body, r.file_name), ru.username
    FROM messages m
    LEFT JOIN users u ON m.sender_id = u.id
    LEFT JOIN messages r ON m.reply_to_id = r.id
    LEFT JOIN users ru ON r.sender_id = ru.id";

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let reply = match row.get::<_, Option<i64>>(11)? {
        Some(id) => Some(ReplyRow {
            id,
            content: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
            sender_username: row
                .get::<_, Option<String>>(13)?
                .unwrap_or_else(|| "unknown".to_string()),
        }),
        None => None,
    };
    Ok(MessageRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        kind: row.get(4)?,
        body: row.get(5)?,
        code_language: row.get(6)?,
        file_name: row.get(7)?,
        file_path: row.get(8)?,
        reply,
        created_at: row.get(9)?,
        edited_at: row.get(10)?,
    })
}

fn query_message(conn: &Connection, id: i64) -> StoreResult<Option<MessageRow>> {
    let mut stmt = conn.prepare(&format!("{MESSAGE_SELECT} WHERE m.id = ?1"))?;
    Ok(stmt.query_row([id], map_message_row).optional()?)
}

fn validate_draft(conn: &Connection, new: &NewMessage) -> StoreResult<()> {
    match new.kind {
        MessageKind::File => {
            if new.file.is_none() {
                return Err(StoreError::Validation(
                    "file messages need a file descriptor".into(),
                ));
            }
            if new.body.is_some() {
                return Err(StoreError::Validation(
                    "file messages carry no body text".into(),
                ));
            }
        }
        _ => {
            if new.body.as_deref().is_none_or(|b| b.trim().is_empty()) {
                return Err(StoreError::Validation("message body must not be empty".into()));
            }
        }
    }
    if let Some(reply_to) = new.reply_to {
        let target_group: Option<i64> = conn
            .query_row(
                "SELECT group_id FROM messages WHERE id = ?1",
                [reply_to],
                |row| row.get(0),
            )
            .optional()?;
        match target_group {
            None => {
                return Err(StoreError::Validation("reply target does not exist".into()));
            }
            Some(g) if g != new.group_id => {
                return Err(StoreError::Validation(
                    "reply target belongs to another group".into(),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// LIKE wildcards in user queries must match literally.
fn escape_like(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
