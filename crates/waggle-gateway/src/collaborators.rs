//! Seams to the collaborators the messaging core consumes but does not
//! own: block relationships and content moderation. Injected through
//! `ChatState` so deployments can swap in real service clients.

use std::collections::HashSet;
use std::sync::RwLock;

use tracing::info;
use uuid::Uuid;

/// Block relationships from the user directory. `is_blocked` is
/// direction-agnostic: a thread is unavailable when either side
/// blocked the other.
pub trait Directory: Send + Sync {
    fn is_blocked(&self, a: Uuid, b: Uuid) -> bool;
    fn record_block(&self, blocker: Uuid, target: Uuid);
}

/// Single-process default; stores block pairs in memory.
#[derive(Default)]
pub struct InMemoryDirectory {
    blocks: RwLock<HashSet<(Uuid, Uuid)>>,
}

impl Directory for InMemoryDirectory {
    fn is_blocked(&self, a: Uuid, b: Uuid) -> bool {
        let blocks = self.blocks.read().expect("block lock poisoned");
        blocks.contains(&(a, b)) || blocks.contains(&(b, a))
    }

    fn record_block(&self, blocker: Uuid, target: Uuid) {
        self.blocks
            .write()
            .expect("block lock poisoned")
            .insert((blocker, target));
    }
}

/// Receives `report` actions; independent of message delivery.
pub trait ModerationSink: Send + Sync {
    fn report(&self, reporter: Uuid, thread_id: Uuid);
}

pub struct LogModeration;

impl ModerationSink for LogModeration {
    fn report(&self, reporter: Uuid, thread_id: Uuid) {
        info!("moderation report: thread={} reporter={}", thread_id, reporter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_apply_in_both_directions() {
        let directory = InMemoryDirectory::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(!directory.is_blocked(a, b));
        directory.record_block(a, b);
        assert!(directory.is_blocked(a, b));
        assert!(directory.is_blocked(b, a));
    }
}
