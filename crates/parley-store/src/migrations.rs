use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            email           TEXT NOT NULL UNIQUE,
            password_hash   TEXT NOT NULL,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            is_active       INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS groups (
            id              INTEGER PRIMARY KEY,
            name            TEXT NOT NULL,
            is_private      INTEGER NOT NULL DEFAULT 0,
            creator_id      INTEGER NOT NULL REFERENCES users(id),
            invite_code     TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id            INTEGER NOT NULL REFERENCES groups(id),
            user_id             INTEGER NOT NULL REFERENCES users(id),
            is_admin            INTEGER NOT NULL DEFAULT 0,
            is_acting_leader    INTEGER NOT NULL DEFAULT 0,
            joined_at           TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(group_id, user_id)
        );

        -- Message ids order the whole store. AUTOINCREMENT keeps them
        -- strictly increasing even across deletes, which is what makes
        -- pagination cursors stable.
        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id        INTEGER NOT NULL REFERENCES groups(id),
            sender_id       INTEGER NOT NULL REFERENCES users(id),
            kind            TEXT NOT NULL,
            body            TEXT,
            code_language   TEXT,
            file_name       TEXT,
            file_path       TEXT,
            reply_to_id     INTEGER REFERENCES messages(id) ON DELETE SET NULL,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            edited_at       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_group
            ON messages(group_id, id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
