use rusqlite::Connection;
use tracing::info;

use waggle_types::{ChatError, ChatResult};

pub fn run(conn: &Connection) -> ChatResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            active      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        -- Two-party conversations. Participants are stored as the
        -- canonical (sorted) pair; the unique index is what resolves
        -- concurrent first-contact creation.
        CREATE TABLE IF NOT EXISTS threads (
            id                TEXT PRIMARY KEY,
            user_lo           TEXT NOT NULL REFERENCES users(id),
            user_hi           TEXT NOT NULL REFERENCES users(id),
            created_at        TEXT NOT NULL,
            last_activity_at  TEXT NOT NULL,
            UNIQUE(user_lo, user_hi)
        );

        -- Append-only history. seq is assigned per thread inside the
        -- insert transaction; rows are never removed, only tombstoned.
        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            thread_id   TEXT NOT NULL REFERENCES threads(id),
            sender_id   TEXT NOT NULL REFERENCES users(id),
            seq         INTEGER NOT NULL,
            content     TEXT NOT NULL,
            attachments TEXT NOT NULL DEFAULT '[]',
            reply_to    TEXT REFERENCES messages(id),
            sent_at     TEXT NOT NULL,
            edited_at   TEXT,
            deleted_at  TEXT,
            UNIQUE(thread_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, seq);

        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            read_at     TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        -- Per-user thread state (archive / favorite).
        CREATE TABLE IF NOT EXISTS thread_flags (
            thread_id   TEXT NOT NULL REFERENCES threads(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            archived    INTEGER NOT NULL DEFAULT 0,
            favorite    INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (thread_id, user_id)
        );
        ",
    )
    .map_err(ChatError::store)?;

    info!("database migrations complete");
    Ok(())
}
