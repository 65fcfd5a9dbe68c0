use std::sync::Arc;

use tokio::sync::broadcast;

use waggle_types::events::GatewayEvent;

use crate::presence::PresenceTracker;
use crate::typing::TypingCoordinator;

/// Manages connected clients and event distribution: one broadcast
/// stream carrying room-scoped events (each connection filters against
/// its subscription set), plus per-user targeted channels held by the
/// presence tracker.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<GatewayEvent>,
    presence: PresenceTracker,
    typing: TypingCoordinator,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                presence: PresenceTracker::new(),
                typing: TypingCoordinator::new(broadcast_tx.clone()),
                broadcast_tx,
            }),
        }
    }

    /// Subscribe to the gateway event stream. Returns a broadcast
    /// receiver; room filtering happens at the connection.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients subscribed to its
    /// room.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.inner.typing
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
