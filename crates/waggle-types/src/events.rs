use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Reaction};

/// Commands sent FROM client TO server over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Subscribe to a thread's broadcast room
    JoinThread { thread_id: Uuid },

    /// Unsubscribe from a thread's broadcast room
    LeaveThread { thread_id: Uuid },

    SendMessage {
        thread_id: Uuid,
        content: String,
        #[serde(default)]
        attachments: Vec<String>,
        reply_to: Option<Uuid>,
    },

    EditMessage {
        thread_id: Uuid,
        message_id: Uuid,
        content: String,
    },

    DeleteMessage { thread_id: Uuid, message_id: Uuid },

    AddReaction {
        thread_id: Uuid,
        message_id: Uuid,
        emoji: String,
    },

    RemoveReaction {
        thread_id: Uuid,
        message_id: Uuid,
        emoji: String,
    },

    /// Signal composing state; `is_typing = true` self-expires after 5s
    /// without renewal.
    Typing { thread_id: Uuid, is_typing: bool },

    MarkRead { thread_id: Uuid },

    ThreadAction {
        thread_id: Uuid,
        action: ThreadAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadAction {
    Archive,
    Unarchive,
    Favorite,
    Unfavorite,
    Block,
    Report,
}

/// Events sent FROM server TO client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid },

    NewMessage { thread_id: Uuid, message: Message },

    MessageEdited {
        thread_id: Uuid,
        message_id: Uuid,
        message: Message,
    },

    MessageDeleted {
        thread_id: Uuid,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    },

    ReactionAdded {
        thread_id: Uuid,
        message_id: Uuid,
        reaction: Reaction,
    },

    ReactionRemoved {
        thread_id: Uuid,
        message_id: Uuid,
        reaction: Reaction,
    },

    UserTyping {
        thread_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    MessagesRead {
        thread_id: Uuid,
        user_id: Uuid,
        read_at: DateTime<Utc>,
    },

    UserOnline { user_id: Uuid, thread_id: Uuid },

    UserOffline { user_id: Uuid, thread_id: Uuid },

    /// Terminal event: one participant blocked the other.
    ThreadBlocked { thread_id: Uuid },

    /// Targeted new-message summary for participants who are connected
    /// but not subscribed to the thread's room.
    Notification {
        thread_id: Uuid,
        sender_id: Uuid,
        title: String,
        body: String,
    },

    /// Structured failure, delivered only to the originating connection.
    Error { message: String, code: String },
}

impl GatewayEvent {
    /// Returns the thread id if this event is scoped to a thread room.
    /// Events that return `None` are targeted and are delivered over a
    /// connection's personal channel instead of the broadcast stream.
    pub fn thread_id(&self) -> Option<Uuid> {
        match self {
            Self::NewMessage { thread_id, .. }
            | Self::MessageEdited { thread_id, .. }
            | Self::MessageDeleted { thread_id, .. }
            | Self::ReactionAdded { thread_id, .. }
            | Self::ReactionRemoved { thread_id, .. }
            | Self::UserTyping { thread_id, .. }
            | Self::MessagesRead { thread_id, .. }
            | Self::UserOnline { thread_id, .. }
            | Self::UserOffline { thread_id, .. }
            | Self::ThreadBlocked { thread_id } => Some(*thread_id),
            Self::Ready { .. } | Self::Notification { .. } | Self::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_snake_case_tags() {
        let cmd: GatewayCommand = serde_json::from_str(
            r#"{"type":"typing","data":{"thread_id":"00000000-0000-0000-0000-000000000001","is_typing":true}}"#,
        )
        .unwrap();
        match cmd {
            GatewayCommand::Typing { is_typing, .. } => assert!(is_typing),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn thread_scoping() {
        let tid = Uuid::new_v4();
        let scoped = GatewayEvent::UserTyping {
            thread_id: tid,
            user_id: Uuid::new_v4(),
            is_typing: true,
        };
        assert_eq!(scoped.thread_id(), Some(tid));

        let targeted = GatewayEvent::Error {
            message: "nope".into(),
            code: "VALIDATION".into(),
        };
        assert_eq!(targeted.thread_id(), None);
    }
}
