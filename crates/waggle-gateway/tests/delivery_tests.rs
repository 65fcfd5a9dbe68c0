use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use waggle_db::Database;
use waggle_gateway::ChatState;
use waggle_gateway::collaborators::{InMemoryDirectory, LogModeration};
use waggle_gateway::delivery::deliver_new_message;
use waggle_gateway::dispatcher::Dispatcher;
use waggle_gateway::fanout::{NotificationSink, OfflineNotification};
use waggle_gateway::presence::ConnectionHandle;
use waggle_types::events::GatewayEvent;

/// Captures offline notifications instead of calling a real service.
#[derive(Default)]
struct RecordingSink {
    seen: Mutex<Vec<OfflineNotification>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, notification: OfflineNotification) {
        self.seen.lock().unwrap().push(notification);
    }
}

fn test_state(sink: Arc<RecordingSink>) -> ChatState {
    ChatState {
        db: Arc::new(Database::open_in_memory().unwrap()),
        dispatcher: Dispatcher::new(),
        notifier: sink,
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

fn connect(
    rooms: &[Uuid],
) -> (ConnectionHandle, mpsc::UnboundedReceiver<GatewayEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ConnectionHandle {
            conn_id: Uuid::new_v4(),
            tx,
            rooms: Arc::new(RwLock::new(rooms.iter().copied().collect::<HashSet<_>>())),
        },
        rx,
    )
}

#[tokio::test]
async fn offline_participant_goes_to_fanout() {
    let sink = Arc::new(RecordingSink::default());
    let state = test_state(sink.clone());
    let sender = new_user(&state.db);
    let recipient = new_user(&state.db);
    let thread = state.db.find_or_create_thread(sender, recipient).unwrap();

    let message = state
        .db
        .append_message(thread.id, sender, "dinner at the dog park?", &[], None)
        .unwrap();
    deliver_new_message(&state, message, thread.participants).await;

    let seen = sink.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].user_id, recipient);
    assert_eq!(seen[0].thread_id, thread.id);
    assert_eq!(seen[0].summary, "dinner at the dog park?");
}

#[tokio::test]
async fn connected_elsewhere_gets_targeted_notification() {
    let sink = Arc::new(RecordingSink::default());
    let state = test_state(sink.clone());
    let sender = new_user(&state.db);
    let recipient = new_user(&state.db);
    let thread = state.db.find_or_create_thread(sender, recipient).unwrap();

    // Recipient is online but not subscribed to this thread's room.
    let (handle, mut rx) = connect(&[]);
    state.dispatcher.presence().register(recipient, handle).await;

    let message = state
        .db
        .append_message(thread.id, sender, "hello", &[], None)
        .unwrap();
    deliver_new_message(&state, message, thread.participants).await;

    match rx.try_recv().unwrap() {
        GatewayEvent::Notification {
            thread_id,
            sender_id,
            body,
            ..
        } => {
            assert_eq!(thread_id, thread.id);
            assert_eq!(sender_id, sender);
            assert_eq!(body, "hello");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(sink.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn room_subscribers_receive_only_the_broadcast() {
    let sink = Arc::new(RecordingSink::default());
    let state = test_state(sink.clone());
    let sender = new_user(&state.db);
    let recipient = new_user(&state.db);
    let thread = state.db.find_or_create_thread(sender, recipient).unwrap();

    let (handle, mut targeted_rx) = connect(&[thread.id]);
    state.dispatcher.presence().register(recipient, handle).await;
    let mut broadcast_rx = state.dispatcher.subscribe();

    let message = state
        .db
        .append_message(thread.id, sender, "walkies", &[], None)
        .unwrap();
    deliver_new_message(&state, message, thread.participants).await;

    match broadcast_rx.try_recv().unwrap() {
        GatewayEvent::NewMessage { thread_id, message } => {
            assert_eq!(thread_id, thread.id);
            assert_eq!(message.content, "walkies");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(targeted_rx.try_recv().is_err());
    assert!(sink.seen.lock().unwrap().is_empty());
}
