//! Per-message business rules (edit/delete grace windows, reaction
//! bookkeeping) layered on the thread store.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use waggle_types::models::{
    DELETE_WINDOW_SECS, DELETED_PLACEHOLDER, EDIT_WINDOW_SECS, MAX_CONTENT_LEN, Message,
};
use waggle_types::{ChatError, ChatResult};

use crate::threads::{get_message, require_participant};
use crate::{Database, OptionalExt, db_err};

struct LifecycleRow {
    sender_id: Uuid,
    sent_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl Database {
    /// Replaces a message's content. Only the sender may edit, and only
    /// within 5 minutes of the original send; the window is measured
    /// from `sent_at` and is never extended.
    pub fn edit_message(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        editor_id: Uuid,
        new_content: &str,
    ) -> ChatResult<Message> {
        if new_content.trim().is_empty() {
            return Err(ChatError::validation("message has no content"));
        }
        if new_content.chars().count() > MAX_CONTENT_LEN {
            return Err(ChatError::validation(format!(
                "content exceeds {MAX_CONTENT_LEN} characters"
            )));
        }

        self.with_conn(|conn| {
            let row = lifecycle_row(conn, thread_id, message_id)?;
            if row.deleted_at.is_some() {
                return Err(ChatError::validation("cannot edit a deleted message"));
            }
            if row.sender_id != editor_id {
                return Err(ChatError::Forbidden("only the sender can edit a message"));
            }
            let age = Utc::now().signed_duration_since(row.sent_at);
            if age.num_seconds() > EDIT_WINDOW_SECS {
                return Err(ChatError::Expired("edit"));
            }

            conn.execute(
                "UPDATE messages SET content = ?1, edited_at = ?2 WHERE id = ?3",
                params![
                    new_content,
                    Utc::now().to_rfc3339(),
                    message_id.to_string()
                ],
            )
            .map_err(db_err)?;

            get_message(conn, thread_id, message_id)
        })
    }

    /// Tombstones a message: content is replaced with a fixed
    /// placeholder while id and position survive. Only the sender may
    /// delete, within 60 minutes of sending. Deleting an already
    /// tombstoned message returns the original deletion time.
    pub fn soft_delete(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        requester_id: Uuid,
    ) -> ChatResult<DateTime<Utc>> {
        self.with_conn(|conn| {
            let row = lifecycle_row(conn, thread_id, message_id)?;
            if let Some(deleted_at) = row.deleted_at {
                return Ok(deleted_at);
            }
            if row.sender_id != requester_id {
                return Err(ChatError::Forbidden(
                    "only the sender can delete a message",
                ));
            }
            let age = Utc::now().signed_duration_since(row.sent_at);
            if age.num_seconds() > DELETE_WINDOW_SECS {
                return Err(ChatError::Expired("delete"));
            }

            let now = Utc::now();
            conn.execute(
                "UPDATE messages SET content = ?1, deleted_at = ?2 WHERE id = ?3",
                params![
                    DELETED_PLACEHOLDER,
                    now.to_rfc3339(),
                    message_id.to_string()
                ],
            )
            .map_err(db_err)?;
            Ok(now)
        })
    }

    /// Idempotent: repeated calls for the same (user, emoji) pair do
    /// nothing. Returns whether a reaction was newly added.
    pub fn add_reaction(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<bool> {
        if emoji.is_empty() {
            return Err(ChatError::validation("emoji must not be empty"));
        }
        self.with_conn(|conn| {
            require_participant(conn, thread_id, user_id)?;
            lifecycle_row(conn, thread_id, message_id)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        message_id.to_string(),
                        user_id.to_string(),
                        emoji,
                        Utc::now().to_rfc3339()
                    ],
                )
                .map_err(db_err)?;
            Ok(inserted > 0)
        })
    }

    /// No-op when the pair is absent. Returns whether a reaction was
    /// removed.
    pub fn remove_reaction(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<bool> {
        self.with_conn(|conn| {
            require_participant(conn, thread_id, user_id)?;
            lifecycle_row(conn, thread_id, message_id)?;
            let removed = conn
                .execute(
                    "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    params![message_id.to_string(), user_id.to_string(), emoji],
                )
                .map_err(db_err)?;
            Ok(removed > 0)
        })
    }
}

fn lifecycle_row(
    conn: &Connection,
    thread_id: Uuid,
    message_id: Uuid,
) -> ChatResult<LifecycleRow> {
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT sender_id, sent_at, deleted_at FROM messages
             WHERE id = ?1 AND thread_id = ?2",
            params![message_id.to_string(), thread_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (sender_id, sent_at, deleted_at) = row.ok_or(ChatError::NotFound("message"))?;
    Ok(LifecycleRow {
        sender_id: crate::models::parse_uuid(&sender_id)?,
        sent_at: crate::models::parse_ts(&sent_at)?,
        deleted_at: crate::models::parse_opt_ts(deleted_at.as_deref())?,
    })
}
