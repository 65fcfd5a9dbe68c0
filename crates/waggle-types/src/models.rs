use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum message content length, in characters.
pub const MAX_CONTENT_LEN: usize = 1000;

/// Content stored in place of a soft-deleted message.
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

/// Messages may be edited by their sender for 5 minutes after sending.
pub const EDIT_WINDOW_SECS: i64 = 5 * 60;

/// Messages may be deleted by their sender for 60 minutes after sending.
pub const DELETE_WINDOW_SECS: i64 = 60 * 60;

/// A two-party conversation. Participants are fixed at creation and
/// stored as a canonical (sorted) pair so lookups by unordered pair
/// are deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Returns the canonical (sorted) ordering of a participant pair.
pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

/// A single message within a thread. Never physically removed;
/// deletion tombstones the row in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub reply_to: Option<Uuid>,
    pub sent_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_edited: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: Uuid,
    pub emoji: String,
}

/// One page of a thread's history, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub next_cursor: Option<Uuid>,
}
