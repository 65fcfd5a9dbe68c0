use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use waggle_types::api::Claims;
use waggle_types::events::{GatewayCommand, GatewayEvent, ThreadAction};
use waggle_types::{ChatError, ChatResult};

use crate::ChatState;
use crate::delivery::deliver_new_message;
use crate::presence::ConnectionHandle;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The client must present a valid Identify within this window or the
/// socket is closed.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Rooms = Arc<StdRwLock<HashSet<Uuid>>>;

/// Handle a single WebSocket connection through its whole lifecycle:
/// unauthenticated → authenticated → subscribed to rooms → closed.
/// Handshake failure is the only error that closes the socket; every
/// later failure is reported to this connection and leaves it open.
pub async fn handle_connection(socket: WebSocket, state: ChatState) {
    let (mut sender, mut receiver) = socket.split();

    let user_id = match wait_for_identify(&mut receiver, &state).await {
        Some(id) => id,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!("{} connected to gateway", user_id);

    let ready = GatewayEvent::Ready { user_id };
    if sender
        .send(WsMessage::Text(
            serde_json::to_string(&ready).unwrap().into(),
        ))
        .await
        .is_err()
    {
        return;
    }

    run_connection_loop(sender, receiver, state, user_id).await;
}

async fn run_connection_loop(
    mut sender: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    state: ChatState,
    user_id: Uuid,
) {
    let conn_id = Uuid::new_v4();
    let (tx, mut targeted_rx) = mpsc::unbounded_channel();
    let rooms: Rooms = Arc::new(StdRwLock::new(HashSet::new()));

    state
        .dispatcher
        .presence()
        .register(
            user_id,
            ConnectionHandle {
                conn_id,
                tx: tx.clone(),
                rooms: rooms.clone(),
            },
        )
        .await;

    let mut broadcast_rx = state.dispatcher.subscribe();
    let send_rooms = rooms.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward room broadcasts + targeted events to the client, with
    // heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if let Some(thread_id) = event.thread_id() {
                        let subscribed = send_rooms
                            .read()
                            .expect("room lock poisoned")
                            .contains(&thread_id);
                        if !subscribed {
                            continue;
                        }
                    }

                    // A user's own typing signal is never echoed back.
                    if let GatewayEvent::UserTyping { user_id: typist, .. } = &event {
                        if *typist == user_id {
                            continue;
                        }
                    }

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = targeted_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout, dropping connection for {}", user_id);
                            break;
                        }
                    }
                    if sender.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let recv_state = state.clone();
    let recv_rooms = rooms.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&recv_state, user_id, &recv_rooms, &tx, cmd).await;
                    }
                    Err(e) => {
                        debug!("{} bad command: {} -- raw: {}", user_id, e, log_snippet(&text));
                        let _ = tx.send(GatewayEvent::Error {
                            message: "malformed payload".to_string(),
                            code: "VALIDATION".to_string(),
                        });
                    }
                },
                WsMessage::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Teardown: presence first, then typing timers, then offline
    // events for every room this connection was in, but only when it
    // was the user's last live connection.
    let was_last = state
        .dispatcher
        .presence()
        .unregister(user_id, conn_id)
        .await;
    state.dispatcher.typing().cancel_user(user_id);

    if was_last {
        let subscribed: Vec<Uuid> = rooms
            .read()
            .expect("room lock poisoned")
            .iter()
            .copied()
            .collect();
        for thread_id in subscribed {
            state
                .dispatcher
                .broadcast(GatewayEvent::UserOffline { user_id, thread_id });
        }
    }

    info!("{} disconnected from gateway", user_id);
}

/// Longest payload prefix echoed into the log on a malformed command.
const LOG_SNIPPET_LEN: usize = 200;

/// Truncates a client payload for logging without splitting a
/// character.
fn log_snippet(text: &str) -> &str {
    if text.len() <= LOG_SNIPPET_LEN {
        return text;
    }
    let mut end = LOG_SNIPPET_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Waits for an Identify command carrying a valid JWT for an active
/// account. Returns None on timeout, bad token, or inactive identity;
/// all three are terminal.
async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &ChatState,
) -> Option<Uuid> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let jwt_secret = state.jwt_secret.clone();
    let token = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let WsMessage::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return Some(token);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()?;

    let claims = decode::<Claims>(
        &token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?
    .claims;

    let db = state.db.clone();
    let user = tokio::task::spawn_blocking(move || db.get_user_by_id(&claims.sub.to_string()))
        .await
        .ok()?
        .ok()??;
    if !user.active {
        warn!("rejected inactive account {}", claims.sub);
        return None;
    }

    Some(claims.sub)
}

/// Central command router. Failures are surfaced as a structured
/// `error` event to the originating connection only, never broadcast.
async fn handle_command(
    state: &ChatState,
    user_id: Uuid,
    rooms: &Rooms,
    reply: &mpsc::UnboundedSender<GatewayEvent>,
    cmd: GatewayCommand,
) {
    let result = match cmd {
        GatewayCommand::Identify { .. } => Ok(()), // already handled

        GatewayCommand::JoinThread { thread_id } => {
            join_thread(state, user_id, rooms, reply, thread_id).await
        }

        GatewayCommand::LeaveThread { thread_id } => {
            rooms
                .write()
                .expect("room lock poisoned")
                .remove(&thread_id);
            state
                .dispatcher
                .broadcast(GatewayEvent::UserOffline { user_id, thread_id });
            Ok(())
        }

        GatewayCommand::SendMessage {
            thread_id,
            content,
            attachments,
            reply_to,
        } => send_message(state, user_id, thread_id, content, attachments, reply_to).await,

        GatewayCommand::EditMessage {
            thread_id,
            message_id,
            content,
        } => {
            let db = state.db.clone();
            let message = tokio::task::spawn_blocking(move || {
                db.edit_message(thread_id, message_id, user_id, &content)
            })
            .await
            .map_err(ChatError::store)
            .and_then(|r| r);
            message.map(|message| {
                state.dispatcher.broadcast(GatewayEvent::MessageEdited {
                    thread_id,
                    message_id,
                    message,
                });
            })
        }

        GatewayCommand::DeleteMessage {
            thread_id,
            message_id,
        } => {
            let db = state.db.clone();
            let deleted_at = tokio::task::spawn_blocking(move || {
                db.soft_delete(thread_id, message_id, user_id)
            })
            .await
            .map_err(ChatError::store)
            .and_then(|r| r);
            deleted_at.map(|deleted_at| {
                state.dispatcher.broadcast(GatewayEvent::MessageDeleted {
                    thread_id,
                    message_id,
                    deleted_at,
                });
            })
        }

        GatewayCommand::AddReaction {
            thread_id,
            message_id,
            emoji,
        } => react(state, user_id, thread_id, message_id, emoji, true).await,

        GatewayCommand::RemoveReaction {
            thread_id,
            message_id,
            emoji,
        } => react(state, user_id, thread_id, message_id, emoji, false).await,

        GatewayCommand::Typing {
            thread_id,
            is_typing,
        } => {
            let subscribed = rooms
                .read()
                .expect("room lock poisoned")
                .contains(&thread_id);
            if !subscribed {
                Err(ChatError::Forbidden("join the thread before typing"))
            } else {
                if is_typing {
                    state.dispatcher.typing().start(thread_id, user_id);
                } else {
                    state.dispatcher.typing().stop(thread_id, user_id);
                }
                Ok(())
            }
        }

        GatewayCommand::MarkRead { thread_id } => {
            let db = state.db.clone();
            let changed =
                tokio::task::spawn_blocking(move || db.mark_read(thread_id, user_id))
                    .await
                    .map_err(ChatError::store)
                    .and_then(|r| r);
            changed.map(|changed| {
                if changed {
                    state.dispatcher.broadcast(GatewayEvent::MessagesRead {
                        thread_id,
                        user_id,
                        read_at: Utc::now(),
                    });
                }
            })
        }

        GatewayCommand::ThreadAction { thread_id, action } => {
            thread_action(state, user_id, thread_id, action).await
        }
    };

    if let Err(err) = result {
        debug!("{} command failed: {}", user_id, err);
        let _ = reply.send(GatewayEvent::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        });
    }
}

/// Verifies membership and block state, subscribes the connection,
/// marks the history read, announces the user, and replays active
/// typers to the joining connection only.
async fn join_thread(
    state: &ChatState,
    user_id: Uuid,
    rooms: &Rooms,
    reply: &mpsc::UnboundedSender<GatewayEvent>,
    thread_id: Uuid,
) -> ChatResult<()> {
    let db = state.db.clone();
    let participants =
        tokio::task::spawn_blocking(move || db.require_participant(thread_id, user_id))
            .await
            .map_err(ChatError::store)??;

    if let Some(&peer) = participants.iter().find(|&&p| p != user_id) {
        if state.directory.is_blocked(user_id, peer) {
            return Err(ChatError::Forbidden("thread unavailable"));
        }
    }

    rooms
        .write()
        .expect("room lock poisoned")
        .insert(thread_id);

    let db = state.db.clone();
    let changed = tokio::task::spawn_blocking(move || db.mark_read(thread_id, user_id))
        .await
        .map_err(ChatError::store)??;
    if changed {
        state.dispatcher.broadcast(GatewayEvent::MessagesRead {
            thread_id,
            user_id,
            read_at: Utc::now(),
        });
    }

    state
        .dispatcher
        .broadcast(GatewayEvent::UserOnline { user_id, thread_id });

    for typist in state.dispatcher.typing().active_typers(thread_id) {
        if typist != user_id {
            let _ = reply.send(GatewayEvent::UserTyping {
                thread_id,
                user_id: typist,
                is_typing: true,
            });
        }
    }

    Ok(())
}

async fn send_message(
    state: &ChatState,
    user_id: Uuid,
    thread_id: Uuid,
    content: String,
    attachments: Vec<String>,
    reply_to: Option<Uuid>,
) -> ChatResult<()> {
    let db = state.db.clone();
    let (message, participants) = tokio::task::spawn_blocking(move || {
        let message = db.append_message(thread_id, user_id, &content, &attachments, reply_to)?;
        let participants = db.thread_participants(thread_id)?;
        Ok::<_, ChatError>((message, participants))
    })
    .await
    .map_err(ChatError::store)??;

    deliver_new_message(state, message, participants).await;
    Ok(())
}

async fn react(
    state: &ChatState,
    user_id: Uuid,
    thread_id: Uuid,
    message_id: Uuid,
    emoji: String,
    add: bool,
) -> ChatResult<()> {
    let db = state.db.clone();
    let event_emoji = emoji.clone();
    let changed = tokio::task::spawn_blocking(move || {
        if add {
            db.add_reaction(thread_id, message_id, user_id, &emoji)
        } else {
            db.remove_reaction(thread_id, message_id, user_id, &emoji)
        }
    })
    .await
    .map_err(ChatError::store)??;

    // Idempotent repeats produce no event.
    if changed {
        let reaction = waggle_types::models::Reaction {
            user_id,
            emoji: event_emoji,
        };
        let event = if add {
            GatewayEvent::ReactionAdded {
                thread_id,
                message_id,
                reaction,
            }
        } else {
            GatewayEvent::ReactionRemoved {
                thread_id,
                message_id,
                reaction,
            }
        };
        state.dispatcher.broadcast(event);
    }
    Ok(())
}

/// Per-user archive/favorite flags are acknowledged silently; `block`
/// tears the room down for both sides; `report` goes to the moderation
/// collaborator.
async fn thread_action(
    state: &ChatState,
    user_id: Uuid,
    thread_id: Uuid,
    action: ThreadAction,
) -> ChatResult<()> {
    let flags = |archived: Option<bool>, favorite: Option<bool>| {
        let db = state.db.clone();
        tokio::task::spawn_blocking(move || {
            db.set_thread_flags(thread_id, user_id, archived, favorite)
        })
    };

    match action {
        ThreadAction::Archive => flags(Some(true), None).await.map_err(ChatError::store)?,
        ThreadAction::Unarchive => flags(Some(false), None).await.map_err(ChatError::store)?,
        ThreadAction::Favorite => flags(None, Some(true)).await.map_err(ChatError::store)?,
        ThreadAction::Unfavorite => flags(None, Some(false)).await.map_err(ChatError::store)?,

        ThreadAction::Block => {
            let db = state.db.clone();
            let participants =
                tokio::task::spawn_blocking(move || db.require_participant(thread_id, user_id))
                    .await
                    .map_err(ChatError::store)??;
            if let Some(&peer) = participants.iter().find(|&&p| p != user_id) {
                state.directory.record_block(user_id, peer);
            }

            info!("{} blocked thread {}", user_id, thread_id);

            // Deliver the terminal event before tearing the room down;
            // the broadcast path would race the unsubscribe.
            let presence = state.dispatcher.presence();
            for participant in participants {
                presence
                    .send_to_user(participant, GatewayEvent::ThreadBlocked { thread_id })
                    .await;
                state.dispatcher.typing().stop(thread_id, participant);
            }
            presence.force_unsubscribe(&participants, thread_id).await;
            Ok(())
        }

        ThreadAction::Report => {
            state.moderation.report(user_id, thread_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryDirectory, LogModeration};
    use crate::dispatcher::Dispatcher;
    use crate::fanout::LogNotifier;
    use waggle_db::Database;

    fn test_state() -> ChatState {
        ChatState {
            db: Arc::new(Database::open_in_memory().unwrap()),
            dispatcher: Dispatcher::new(),
            notifier: Arc::new(LogNotifier),
            moderation: Arc::new(LogModeration),
            directory: Arc::new(InMemoryDirectory::default()),
            jwt_secret: "test-secret".into(),
        }
    }

    fn new_user(db: &Database) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), &format!("user-{id}"), "hash")
            .unwrap();
        id
    }

    #[test]
    fn log_snippet_stops_on_char_boundaries() {
        let ascii = "a".repeat(300);
        assert_eq!(log_snippet(&ascii).len(), LOG_SNIPPET_LEN);

        // A multibyte character straddling the cut must not panic.
        let mut tricky = "a".repeat(LOG_SNIPPET_LEN - 1);
        tricky.push_str("🐶🐶");
        let snippet = log_snippet(&tricky);
        assert_eq!(snippet.len(), LOG_SNIPPET_LEN - 1);
        assert!(tricky.is_char_boundary(snippet.len()));

        assert_eq!(log_snippet("short"), "short");
    }

    #[tokio::test]
    async fn outsider_join_is_rejected_and_never_subscribed() {
        let state = test_state();
        let a = new_user(&state.db);
        let b = new_user(&state.db);
        let outsider = new_user(&state.db);
        let thread = state.db.find_or_create_thread(a, b).unwrap();

        let rooms: Rooms = Arc::new(StdRwLock::new(HashSet::new()));
        let (tx, mut reply_rx) = mpsc::unbounded_channel();
        let mut broadcast_rx = state.dispatcher.subscribe();

        handle_command(
            &state,
            outsider,
            &rooms,
            &tx,
            GatewayCommand::JoinThread {
                thread_id: thread.id,
            },
        )
        .await;

        // The failure reaches the caller only, as an error event.
        match reply_rx.try_recv().unwrap() {
            GatewayEvent::Error { code, .. } => assert_eq!(code, "NOT_FOUND"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(reply_rx.try_recv().is_err());
        assert!(broadcast_rx.try_recv().is_err());
        assert!(rooms.read().unwrap().is_empty());
    }
}
