//! ThreadStore: thread creation, ordered append, read receipts and
//! cursor pagination.

use chrono::Utc;
use rusqlite::{Connection, params};
use uuid::Uuid;

use waggle_types::models::{
    MAX_CONTENT_LEN, Message, MessagePage, Reaction, ReadReceipt, Thread, canonical_pair,
};
use waggle_types::{ChatError, ChatResult};

use crate::models::{MessageRow, parse_ts, parse_uuid};
use crate::{Database, OptionalExt, db_err};

impl Database {
    /// Looks up the thread for an unordered participant pair, creating
    /// it on first contact. A unique-pair violation from a concurrent
    /// creator is resolved by re-fetching the winner's row rather than
    /// surfacing the conflict.
    pub fn find_or_create_thread(&self, a: Uuid, b: Uuid) -> ChatResult<Thread> {
        if a == b {
            return Err(ChatError::validation("cannot open a thread with yourself"));
        }
        let (lo, hi) = canonical_pair(a, b);

        self.with_conn(|conn| {
            if let Some(thread) = query_thread_by_pair(conn, lo, hi)? {
                return Ok(thread);
            }

            let thread = Thread {
                id: Uuid::new_v4(),
                participants: [lo, hi],
                created_at: Utc::now(),
                last_activity_at: Utc::now(),
            };
            let inserted = conn.execute(
                "INSERT INTO threads (id, user_lo, user_hi, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    thread.id.to_string(),
                    lo.to_string(),
                    hi.to_string(),
                    thread.created_at.to_rfc3339(),
                    thread.last_activity_at.to_rfc3339(),
                ],
            );
            match inserted.map_err(db_err) {
                Ok(_) => Ok(thread),
                // Lost the creation race: the other writer's row is
                // authoritative, return it instead.
                Err(ChatError::Conflict) => {
                    query_thread_by_pair(conn, lo, hi)?.ok_or(ChatError::Conflict)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Participants of a thread. `NotFound` when the thread does not exist.
    pub fn thread_participants(&self, thread_id: Uuid) -> ChatResult<[Uuid; 2]> {
        self.with_conn(|conn| {
            participants(conn, thread_id)?.ok_or(ChatError::NotFound("thread"))
        })
    }

    /// Participants of a thread, failing with `NotFound` when the thread
    /// is missing *or* the caller is not a member, so existence is never
    /// revealed to outsiders.
    pub fn require_participant(&self, thread_id: Uuid, user_id: Uuid) -> ChatResult<[Uuid; 2]> {
        self.with_conn(|conn| require_participant(conn, thread_id, user_id))
    }

    /// Appends a message with a server-assigned timestamp and per-thread
    /// sequence number, marks it read by the sender and bumps the
    /// thread's activity clock, all in one transaction.
    pub fn append_message(
        &self,
        thread_id: Uuid,
        sender_id: Uuid,
        content: &str,
        attachments: &[String],
        reply_to: Option<Uuid>,
    ) -> ChatResult<Message> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::validation("message has no content"));
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(ChatError::validation(format!(
                "content exceeds {MAX_CONTENT_LEN} characters"
            )));
        }

        self.with_conn(|conn| {
            require_participant(conn, thread_id, sender_id)?;

            if let Some(parent) = reply_to {
                let in_thread: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM messages WHERE id = ?1 AND thread_id = ?2",
                        params![parent.to_string(), thread_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if in_thread.is_none() {
                    return Err(ChatError::NotFound("message"));
                }
            }

            let now = Utc::now();
            let id = Uuid::new_v4();
            let attachments_json =
                serde_json::to_string(attachments).map_err(ChatError::store)?;

            let tx = conn.unchecked_transaction().map_err(db_err)?;
            let seq: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE thread_id = ?1",
                    params![thread_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            tx.execute(
                "INSERT INTO messages (id, thread_id, sender_id, seq, content, attachments, reply_to, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.to_string(),
                    thread_id.to_string(),
                    sender_id.to_string(),
                    seq,
                    content,
                    attachments_json,
                    reply_to.map(|r| r.to_string()),
                    now.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            tx.execute(
                "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), sender_id.to_string(), now.to_rfc3339()],
            )
            .map_err(db_err)?;
            tx.execute(
                "UPDATE threads SET last_activity_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), thread_id.to_string()],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            Ok(Message {
                id,
                thread_id,
                sender_id,
                content: content.to_string(),
                attachments: attachments.to_vec(),
                reply_to,
                sent_at: now,
                edited_at: None,
                is_edited: false,
                deleted_at: None,
                read_by: vec![ReadReceipt {
                    user_id: sender_id,
                    read_at: now,
                }],
                reactions: Vec::new(),
            })
        })
    }

    /// Adds a read receipt for every message in the thread not authored
    /// by `user_id` that lacks one. Returns whether anything changed so
    /// callers can skip redundant read-receipt events.
    pub fn mark_read(&self, thread_id: Uuid, user_id: Uuid) -> ChatResult<bool> {
        self.with_conn(|conn| {
            require_participant(conn, thread_id, user_id)?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
                     SELECT id, ?2, ?3 FROM messages
                     WHERE thread_id = ?1 AND sender_id != ?2",
                    params![
                        thread_id.to_string(),
                        user_id.to_string(),
                        Utc::now().to_rfc3339()
                    ],
                )
                .map_err(db_err)?;
            Ok(inserted > 0)
        })
    }

    /// Cursor pagination over a thread's history. Pages are returned
    /// oldest-first; `next_cursor` is the id of the oldest returned
    /// message when older history remains. A cursor that does not
    /// resolve yields an empty page rather than an error (tombstoned
    /// messages remain addressable cursors).
    pub fn paginate(
        &self,
        thread_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> ChatResult<MessagePage> {
        let limit = limit.clamp(1, 100) as i64;

        self.with_conn(|conn| {
            let cursor_seq: Option<i64> = match before {
                Some(cursor) => {
                    let seq = conn
                        .query_row(
                            "SELECT seq FROM messages WHERE id = ?1 AND thread_id = ?2",
                            params![cursor.to_string(), thread_id.to_string()],
                            |row| row.get(0),
                        )
                        .optional()?;
                    match seq {
                        Some(s) => Some(s),
                        None => {
                            return Ok(MessagePage {
                                messages: Vec::new(),
                                has_more: false,
                                next_cursor: None,
                            });
                        }
                    }
                }
                None => None,
            };

            // Fetch one extra row to learn whether older history remains.
            let mut rows = match cursor_seq {
                Some(seq) => query_message_rows(
                    conn,
                    "SELECT id, thread_id, sender_id, seq, content, attachments, reply_to,
                            sent_at, edited_at, deleted_at
                     FROM messages WHERE thread_id = ?1 AND seq < ?2
                     ORDER BY seq DESC LIMIT ?3",
                    params![thread_id.to_string(), seq, limit + 1],
                )?,
                None => query_message_rows(
                    conn,
                    "SELECT id, thread_id, sender_id, seq, content, attachments, reply_to,
                            sent_at, edited_at, deleted_at
                     FROM messages WHERE thread_id = ?1
                     ORDER BY seq DESC LIMIT ?2",
                    params![thread_id.to_string(), limit + 1],
                )?,
            };

            let has_more = rows.len() as i64 > limit;
            rows.truncate(limit as usize);
            rows.reverse(); // ascending chronological order

            let messages = attach_details(conn, rows)?;
            let next_cursor = if has_more {
                messages.first().map(|m| m.id)
            } else {
                None
            };
            Ok(MessagePage {
                messages,
                has_more,
                next_cursor,
            })
        })
    }

    /// Fetches a single message with its receipts and reactions.
    pub fn get_message(&self, thread_id: Uuid, message_id: Uuid) -> ChatResult<Message> {
        self.with_conn(|conn| get_message(conn, thread_id, message_id))
    }

    /// Per-user archive/favorite flags. `None` leaves a flag untouched.
    pub fn set_thread_flags(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        archived: Option<bool>,
        favorite: Option<bool>,
    ) -> ChatResult<()> {
        self.with_conn(|conn| {
            require_participant(conn, thread_id, user_id)?;
            conn.execute(
                "INSERT INTO thread_flags (thread_id, user_id, archived, favorite)
                 VALUES (?1, ?2, COALESCE(?3, 0), COALESCE(?4, 0))
                 ON CONFLICT(thread_id, user_id) DO UPDATE SET
                     archived = COALESCE(?3, archived),
                     favorite = COALESCE(?4, favorite)",
                params![
                    thread_id.to_string(),
                    user_id.to_string(),
                    archived.map(i64::from),
                    favorite.map(i64::from),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }
}

pub(crate) fn require_participant(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
) -> ChatResult<[Uuid; 2]> {
    let participants =
        participants(conn, thread_id)?.ok_or(ChatError::NotFound("thread"))?;
    if !participants.contains(&user_id) {
        return Err(ChatError::NotFound("thread"));
    }
    Ok(participants)
}

fn participants(conn: &Connection, thread_id: Uuid) -> ChatResult<Option<[Uuid; 2]>> {
    let pair: Option<(String, String)> = conn
        .query_row(
            "SELECT user_lo, user_hi FROM threads WHERE id = ?1",
            params![thread_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match pair {
        Some((lo, hi)) => Ok(Some([parse_uuid(&lo)?, parse_uuid(&hi)?])),
        None => Ok(None),
    }
}

fn query_thread_by_pair(conn: &Connection, lo: Uuid, hi: Uuid) -> ChatResult<Option<Thread>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, created_at, last_activity_at FROM threads
             WHERE user_lo = ?1 AND user_hi = ?2",
            params![lo.to_string(), hi.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    match row {
        Some((id, created_at, last_activity_at)) => Ok(Some(Thread {
            id: parse_uuid(&id)?,
            participants: [lo, hi],
            created_at: parse_ts(&created_at)?,
            last_activity_at: parse_ts(&last_activity_at)?,
        })),
        None => Ok(None),
    }
}

pub(crate) fn get_message(
    conn: &Connection,
    thread_id: Uuid,
    message_id: Uuid,
) -> ChatResult<Message> {
    let rows = query_message_rows(
        conn,
        "SELECT id, thread_id, sender_id, seq, content, attachments, reply_to,
                sent_at, edited_at, deleted_at
         FROM messages WHERE id = ?1 AND thread_id = ?2",
        params![message_id.to_string(), thread_id.to_string()],
    )?;
    let mut messages = attach_details(conn, rows)?;
    messages.pop().ok_or(ChatError::NotFound("message"))
}

fn query_message_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> ChatResult<Vec<MessageRow>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                sender_id: row.get(2)?,
                seq: row.get(3)?,
                content: row.get(4)?,
                attachments: row.get(5)?,
                reply_to: row.get(6)?,
                sent_at: row.get(7)?,
                edited_at: row.get(8)?,
                deleted_at: row.get(9)?,
            })
        })
        .map_err(db_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Batch-loads receipts and reactions for a set of rows and converts
/// them to wire messages, preserving row order.
fn attach_details(conn: &Connection, rows: Vec<MessageRow>) -> ChatResult<Vec<Message>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let id_params: Vec<&dyn rusqlite::types::ToSql> = ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let mut receipts: std::collections::HashMap<String, Vec<ReadReceipt>> =
        std::collections::HashMap::new();
    {
        let sql = format!(
            "SELECT message_id, user_id, read_at FROM read_receipts WHERE message_id IN ({})",
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let mapped = stmt
            .query_map(id_params.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        for (message_id, user_id, read_at) in mapped {
            receipts.entry(message_id).or_default().push(ReadReceipt {
                user_id: parse_uuid(&user_id)?,
                read_at: parse_ts(&read_at)?,
            });
        }
    }

    let mut reactions: std::collections::HashMap<String, Vec<Reaction>> =
        std::collections::HashMap::new();
    {
        let sql = format!(
            "SELECT message_id, user_id, emoji FROM reactions
             WHERE message_id IN ({}) ORDER BY created_at",
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let mapped = stmt
            .query_map(id_params.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        for (message_id, user_id, emoji) in mapped {
            reactions.entry(message_id).or_default().push(Reaction {
                user_id: parse_uuid(&user_id)?,
                emoji,
            });
        }
    }

    rows.into_iter()
        .map(|row| {
            let id = row.id.clone();
            let mut message = row.into_message()?;
            message.read_by = receipts.remove(&id).unwrap_or_default();
            message.reactions = reactions.remove(&id).unwrap_or_default();
            Ok(message)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn new_user(db: &Database) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), &format!("user-{id}"), "hash")
            .unwrap();
        id
    }

    #[test]
    fn find_or_create_is_order_independent() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);

        let t1 = db.find_or_create_thread(a, b).unwrap();
        let t2 = db.find_or_create_thread(b, a).unwrap();
        assert_eq!(t1.id, t2.id);

        let (lo, hi) = canonical_pair(a, b);
        assert_eq!(t1.participants, [lo, hi]);
    }

    #[test]
    fn find_or_create_rejects_self_thread() {
        let db = test_db();
        let a = new_user(&db);
        assert!(matches!(
            db.find_or_create_thread(a, a),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn concurrent_first_contact_yields_one_thread() {
        let db = Arc::new(test_db());
        let a = new_user(&db);
        let b = new_user(&db);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.find_or_create_thread(a, b).unwrap().id)
            })
            .collect();
        let ids: Vec<Uuid> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn append_orders_by_arrival_and_receipts_sender() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);
        let thread = db.find_or_create_thread(a, b).unwrap();

        for i in 0..5 {
            let sender = if i % 2 == 0 { a } else { b };
            db.append_message(thread.id, sender, &format!("m{i}"), &[], None)
                .unwrap();
        }

        let page = db.paginate(thread.id, None, 20).unwrap();
        let contents: Vec<&str> = page.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m0", "m1", "m2", "m3", "m4"]);

        // Sender reads their own message immediately.
        let first = &page.messages[0];
        assert_eq!(first.read_by.len(), 1);
        assert_eq!(first.read_by[0].user_id, a);
    }

    #[test]
    fn append_rejects_outsiders_without_leaking() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);
        let outsider = new_user(&db);
        let thread = db.find_or_create_thread(a, b).unwrap();

        assert!(matches!(
            db.append_message(thread.id, outsider, "hi", &[], None),
            Err(ChatError::NotFound("thread"))
        ));
    }

    #[test]
    fn reply_must_resolve_in_same_thread() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);
        let c = new_user(&db);
        let t1 = db.find_or_create_thread(a, b).unwrap();
        let t2 = db.find_or_create_thread(a, c).unwrap();

        let other = db.append_message(t2.id, a, "elsewhere", &[], None).unwrap();
        assert!(matches!(
            db.append_message(t1.id, a, "reply", &[], Some(other.id)),
            Err(ChatError::NotFound("message"))
        ));

        let parent = db.append_message(t1.id, a, "parent", &[], None).unwrap();
        let reply = db
            .append_message(t1.id, b, "reply", &[], Some(parent.id))
            .unwrap();
        assert_eq!(reply.reply_to, Some(parent.id));
    }

    #[test]
    fn content_validation() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);
        let thread = db.find_or_create_thread(a, b).unwrap();

        assert!(matches!(
            db.append_message(thread.id, a, "   ", &[], None),
            Err(ChatError::Validation(_))
        ));

        let long = "x".repeat(MAX_CONTENT_LEN + 1);
        assert!(matches!(
            db.append_message(thread.id, a, &long, &[], None),
            Err(ChatError::Validation(_))
        ));

        // Attachment-only messages are allowed.
        let attachment = vec!["upload://photo-1".to_string()];
        let msg = db.append_message(thread.id, a, "", &attachment, None).unwrap();
        assert_eq!(msg.attachments, attachment);
    }

    #[test]
    fn mark_read_is_idempotent() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);
        let thread = db.find_or_create_thread(a, b).unwrap();
        db.append_message(thread.id, a, "hello", &[], None).unwrap();
        db.append_message(thread.id, a, "again", &[], None).unwrap();

        assert!(db.mark_read(thread.id, b).unwrap());
        assert!(!db.mark_read(thread.id, b).unwrap());

        // Nothing unread authored by others for the sender.
        assert!(!db.mark_read(thread.id, a).unwrap());
    }

    #[test]
    fn first_contact_scenario() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);

        let thread = db.find_or_create_thread(a, b).unwrap();
        db.append_message(thread.id, a, "hi", &[], None).unwrap();

        let page = db.paginate(thread.id, None, 20).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].content, "hi");
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn pagination_round_trip() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);
        let thread = db.find_or_create_thread(a, b).unwrap();
        for i in 0..30 {
            db.append_message(thread.id, a, &format!("m{i}"), &[], None)
                .unwrap();
        }

        let first = db.paginate(thread.id, None, 20).unwrap();
        assert_eq!(first.messages.len(), 20);
        assert!(first.has_more);
        // Oldest of the newest 20 = the 11th-from-latest message.
        assert_eq!(first.messages[0].content, "m10");
        assert_eq!(first.next_cursor, Some(first.messages[0].id));

        let second = db
            .paginate(thread.id, first.next_cursor, 20)
            .unwrap();
        assert_eq!(second.messages.len(), 10);
        assert!(!second.has_more);
        assert!(second.next_cursor.is_none());

        // Concatenating older pages before newer ones reconstructs the
        // full history with no gaps or duplicates.
        let mut all: Vec<String> = second
            .messages
            .iter()
            .chain(first.messages.iter())
            .map(|m| m.content.clone())
            .collect();
        let expected: Vec<String> = (0..30).map(|i| format!("m{i}")).collect();
        assert_eq!(all.len(), 30);
        all.dedup();
        assert_eq!(all, expected);
    }

    #[test]
    fn unknown_cursor_yields_empty_page() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);
        let thread = db.find_or_create_thread(a, b).unwrap();
        db.append_message(thread.id, a, "hi", &[], None).unwrap();

        let page = db.paginate(thread.id, Some(Uuid::new_v4()), 20).unwrap();
        assert!(page.messages.is_empty());
        assert!(!page.has_more);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn limit_is_clamped() {
        let db = test_db();
        let a = new_user(&db);
        let b = new_user(&db);
        let thread = db.find_or_create_thread(a, b).unwrap();
        for i in 0..3 {
            db.append_message(thread.id, a, &format!("m{i}"), &[], None)
                .unwrap();
        }

        let page = db.paginate(thread.id, None, 0).unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].content, "m2");
        assert!(page.has_more);
    }
}
