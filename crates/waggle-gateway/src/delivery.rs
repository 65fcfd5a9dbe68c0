use uuid::Uuid;

use waggle_types::events::GatewayEvent;
use waggle_types::models::Message;

use crate::ChatState;
use crate::fanout::{OfflineNotification, summarize};

/// Routes a freshly appended message: broadcast to the thread room,
/// a targeted `notification` for participants connected elsewhere,
/// and the offline fanout for participants with no live connection.
/// Shared by the socket and REST send paths.
pub async fn deliver_new_message(state: &ChatState, message: Message, participants: [Uuid; 2]) {
    let thread_id = message.thread_id;
    let sender_id = message.sender_id;
    let summary = summarize(&message.content, &message.attachments);

    state.dispatcher.broadcast(GatewayEvent::NewMessage { thread_id, message });

    let presence = state.dispatcher.presence();
    for peer in participants {
        if peer == sender_id {
            continue;
        }
        if presence.user_in_room(peer, thread_id).await {
            // Already receiving the room broadcast.
            continue;
        }
        if presence.is_online(peer).await {
            presence
                .send_to_user(
                    peer,
                    GatewayEvent::Notification {
                        thread_id,
                        sender_id,
                        title: "New message".to_string(),
                        body: summary.clone(),
                    },
                )
                .await;
        } else {
            state
                .notifier
                .notify(OfflineNotification {
                    user_id: peer,
                    thread_id,
                    sender_id,
                    summary: summary.clone(),
                })
                .await;
        }
    }
}
