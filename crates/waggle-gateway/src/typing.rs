use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use waggle_types::events::GatewayEvent;

/// Typing signals self-expire after 5 seconds without renewal.
pub const TYPING_TTL: Duration = Duration::from_secs(5);

/// Self-expiring "is typing" state per (thread, user). Each entry owns
/// a timer task; renewal replaces the task, explicit stop and
/// disconnect abort it. All expiry paths emit the stop event through
/// the shared broadcast stream so room members clear their indicator.
#[derive(Clone)]
pub struct TypingCoordinator {
    inner: Arc<TypingInner>,
}

struct TypingInner {
    entries: Mutex<HashMap<(Uuid, Uuid), JoinHandle<()>>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl TypingCoordinator {
    pub(crate) fn new(events: broadcast::Sender<GatewayEvent>) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                entries: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Starts or renews a typing signal. The "typing started" event is
    /// emitted only on a fresh start; renewals just reset the timer.
    pub fn start(&self, thread_id: Uuid, user_id: Uuid) {
        let key = (thread_id, user_id);
        let inner = self.inner.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(TYPING_TTL).await;
            let expired = inner
                .entries
                .lock()
                .expect("typing lock poisoned")
                .remove(&key)
                .is_some();
            if expired {
                let _ = inner.events.send(GatewayEvent::UserTyping {
                    thread_id,
                    user_id,
                    is_typing: false,
                });
            }
        });

        let previous = self
            .inner
            .entries
            .lock()
            .expect("typing lock poisoned")
            .insert(key, expiry);

        match previous {
            Some(old) => old.abort(),
            None => {
                let _ = self.inner.events.send(GatewayEvent::UserTyping {
                    thread_id,
                    user_id,
                    is_typing: true,
                });
            }
        }
    }

    /// Cancels the timer and emits "stopped typing" synchronously.
    /// No-op when the entry is absent.
    pub fn stop(&self, thread_id: Uuid, user_id: Uuid) {
        let removed = self
            .inner
            .entries
            .lock()
            .expect("typing lock poisoned")
            .remove(&(thread_id, user_id));
        if let Some(handle) = removed {
            handle.abort();
            let _ = self.inner.events.send(GatewayEvent::UserTyping {
                thread_id,
                user_id,
                is_typing: false,
            });
        }
    }

    /// Current typers in a thread, for replay to late-joining
    /// connections.
    pub fn active_typers(&self, thread_id: Uuid) -> Vec<Uuid> {
        self.inner
            .entries
            .lock()
            .expect("typing lock poisoned")
            .keys()
            .filter(|(tid, _)| *tid == thread_id)
            .map(|(_, uid)| *uid)
            .collect()
    }

    /// Eagerly cancels all of a user's entries on disconnect so timers
    /// do not leak across reconnects.
    pub fn cancel_user(&self, user_id: Uuid) {
        let drained: Vec<((Uuid, Uuid), JoinHandle<()>)> = {
            let mut entries = self.inner.entries.lock().expect("typing lock poisoned");
            let keys: Vec<(Uuid, Uuid)> = entries
                .keys()
                .filter(|(_, uid)| *uid == user_id)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|h| (k, h)))
                .collect()
        };
        for ((thread_id, user_id), handle) in drained {
            handle.abort();
            let _ = self.inner.events.send(GatewayEvent::UserTyping {
                thread_id,
                user_id,
                is_typing: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (TypingCoordinator, broadcast::Receiver<GatewayEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (TypingCoordinator::new(tx), rx)
    }

    fn assert_typing_event(
        event: GatewayEvent,
        expect_thread: Uuid,
        expect_user: Uuid,
        expect_typing: bool,
    ) {
        match event {
            GatewayEvent::UserTyping {
                thread_id,
                user_id,
                is_typing,
            } => {
                assert_eq!(thread_id, expect_thread);
                assert_eq!(user_id, expect_user);
                assert_eq!(is_typing, expect_typing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expires_without_renewal() {
        let (typing, mut rx) = coordinator();
        let thread = Uuid::new_v4();
        let user = Uuid::new_v4();

        typing.start(thread, user);
        assert_eq!(typing.active_typers(thread), vec![user]);
        assert_typing_event(rx.recv().await.unwrap(), thread, user, true);

        tokio::time::sleep(TYPING_TTL + Duration::from_secs(1)).await;
        assert!(typing.active_typers(thread).is_empty());
        assert_typing_event(rx.recv().await.unwrap(), thread, user, false);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_the_window_silently() {
        let (typing, mut rx) = coordinator();
        let thread = Uuid::new_v4();
        let user = Uuid::new_v4();

        typing.start(thread, user);
        assert_typing_event(rx.recv().await.unwrap(), thread, user, true);

        tokio::time::sleep(Duration::from_secs(3)).await;
        typing.start(thread, user); // renewal: no second started event

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(typing.active_typers(thread), vec![user]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(typing.active_typers(thread).is_empty());
        assert_typing_event(rx.recv().await.unwrap(), thread, user, false);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_is_synchronous() {
        let (typing, mut rx) = coordinator();
        let thread = Uuid::new_v4();
        let user = Uuid::new_v4();

        typing.start(thread, user);
        assert_typing_event(rx.recv().await.unwrap(), thread, user, true);

        typing.stop(thread, user);
        assert!(typing.active_typers(thread).is_empty());
        assert_typing_event(rx.recv().await.unwrap(), thread, user, false);

        // Stop on an absent entry emits nothing.
        typing.stop(thread, user);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_across_threads() {
        let (typing, mut rx) = coordinator();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let user = Uuid::new_v4();
        let peer = Uuid::new_v4();

        typing.start(t1, user);
        typing.start(t2, user);
        typing.start(t1, peer);
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        typing.cancel_user(user);
        assert!(typing.active_typers(t2).is_empty());
        assert_eq!(typing.active_typers(t1), vec![peer]);
    }
}
