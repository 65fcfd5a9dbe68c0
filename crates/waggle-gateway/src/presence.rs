use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use waggle_types::events::GatewayEvent;

/// One live WebSocket connection: its targeted event channel and the
/// set of thread rooms it is subscribed to. The room set is shared
/// with the connection's send task, which filters the broadcast
/// stream against it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: Uuid,
    pub tx: mpsc::UnboundedSender<GatewayEvent>,
    pub rooms: Arc<StdRwLock<HashSet<Uuid>>>,
}

/// Ephemeral online state, keyed by active connections. A user may
/// hold several simultaneous connections (multi-device); they are
/// online while at least one is live. Process-local; a multi-process
/// deployment must externalize this map.
pub struct PresenceTracker {
    connections: RwLock<HashMap<Uuid, Vec<ConnectionHandle>>>,
}

impl PresenceTracker {
    pub(crate) fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, user_id: Uuid, handle: ConnectionHandle) {
        self.connections
            .write()
            .await
            .entry(user_id)
            .or_default()
            .push(handle);
    }

    /// Drops one connection. Returns true when it was the user's last,
    /// i.e. the user just went offline.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        let Some(handles) = connections.get_mut(&user_id) else {
            return false;
        };
        handles.retain(|h| h.conn_id != conn_id);
        if handles.is_empty() {
            connections.remove(&user_id);
            true
        } else {
            false
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }

    /// Whether any of the user's connections is subscribed to the room.
    pub async fn user_in_room(&self, user_id: Uuid, thread_id: Uuid) -> bool {
        let connections = self.connections.read().await;
        connections.get(&user_id).is_some_and(|handles| {
            handles.iter().any(|h| {
                h.rooms
                    .read()
                    .expect("room lock poisoned")
                    .contains(&thread_id)
            })
        })
    }

    /// Sends a targeted event to every live connection of a user.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let connections = self.connections.read().await;
        if let Some(handles) = connections.get(&user_id) {
            for handle in handles {
                let _ = handle.tx.send(event.clone());
            }
        }
    }

    /// Removes a room from every connection of the given users. Used by
    /// the terminal `block` action to tear a room down.
    pub async fn force_unsubscribe(&self, users: &[Uuid], thread_id: Uuid) {
        let connections = self.connections.read().await;
        for user in users {
            if let Some(handles) = connections.get(user) {
                for handle in handles {
                    handle
                        .rooms
                        .write()
                        .expect("room lock poisoned")
                        .remove(&thread_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(conn_id: Uuid) -> (ConnectionHandle, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle {
                conn_id,
                tx,
                rooms: Arc::new(StdRwLock::new(HashSet::new())),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn online_while_any_connection_lives() {
        let presence = PresenceTracker::new();
        let user = Uuid::new_v4();
        let (phone, _rx1) = handle(Uuid::new_v4());
        let (laptop, _rx2) = handle(Uuid::new_v4());
        let phone_id = phone.conn_id;
        let laptop_id = laptop.conn_id;

        presence.register(user, phone).await;
        presence.register(user, laptop).await;
        assert!(presence.is_online(user).await);

        assert!(!presence.unregister(user, phone_id).await);
        assert!(presence.is_online(user).await);

        assert!(presence.unregister(user, laptop_id).await);
        assert!(!presence.is_online(user).await);
    }

    #[tokio::test]
    async fn targeted_send_reaches_all_devices() {
        let presence = PresenceTracker::new();
        let user = Uuid::new_v4();
        let (phone, mut rx1) = handle(Uuid::new_v4());
        let (laptop, mut rx2) = handle(Uuid::new_v4());
        presence.register(user, phone).await;
        presence.register(user, laptop).await;

        let thread_id = Uuid::new_v4();
        presence
            .send_to_user(user, GatewayEvent::ThreadBlocked { thread_id })
            .await;

        assert!(matches!(
            rx1.try_recv().unwrap(),
            GatewayEvent::ThreadBlocked { .. }
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            GatewayEvent::ThreadBlocked { .. }
        ));
    }

    #[tokio::test]
    async fn force_unsubscribe_clears_rooms() {
        let presence = PresenceTracker::new();
        let user = Uuid::new_v4();
        let (conn, _rx) = handle(Uuid::new_v4());
        let rooms = conn.rooms.clone();
        presence.register(user, conn).await;

        let thread_id = Uuid::new_v4();
        rooms.write().unwrap().insert(thread_id);
        assert!(presence.user_in_room(user, thread_id).await);

        presence.force_unsubscribe(&[user], thread_id).await;
        assert!(!presence.user_in_room(user, thread_id).await);
    }
}
