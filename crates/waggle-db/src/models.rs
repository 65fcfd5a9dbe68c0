//! Database row types; these map directly to SQLite rows. Distinct
//! from the waggle-types wire models to keep the storage layer
//! independent of the protocol surface.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use waggle_types::models::Message;
use waggle_types::{ChatError, ChatResult};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub active: bool,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub seq: i64,
    pub content: String,
    pub attachments: String,
    pub reply_to: Option<String>,
    pub sent_at: String,
    pub edited_at: Option<String>,
    pub deleted_at: Option<String>,
}

pub(crate) fn parse_uuid(s: &str) -> ChatResult<Uuid> {
    s.parse()
        .map_err(|e| ChatError::store(format!("corrupt uuid '{s}': {e}")))
}

pub(crate) fn parse_ts(s: &str) -> ChatResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ChatError::store(format!("corrupt timestamp '{s}': {e}")))
}

pub(crate) fn parse_opt_ts(s: Option<&str>) -> ChatResult<Option<DateTime<Utc>>> {
    s.map(parse_ts).transpose()
}

impl MessageRow {
    /// Converts the row into the wire model; receipts and reactions are
    /// batch-loaded separately and attached by the caller.
    pub fn into_message(self) -> ChatResult<Message> {
        let edited_at = parse_opt_ts(self.edited_at.as_deref())?;
        Ok(Message {
            id: parse_uuid(&self.id)?,
            thread_id: parse_uuid(&self.thread_id)?,
            sender_id: parse_uuid(&self.sender_id)?,
            content: self.content,
            attachments: serde_json::from_str(&self.attachments)
                .map_err(|e| ChatError::store(format!("corrupt attachments: {e}")))?,
            reply_to: self.reply_to.as_deref().map(parse_uuid).transpose()?,
            sent_at: parse_ts(&self.sent_at)?,
            is_edited: edited_at.is_some(),
            edited_at,
            deleted_at: parse_opt_ts(self.deleted_at.as_deref())?,
            read_by: Vec::new(),
            reactions: Vec::new(),
        })
    }
}
