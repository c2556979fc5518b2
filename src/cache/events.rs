//! Content change events.
//!
//! The host publishes one event per change; the queue holds them until the
//! consumer merges them into a purge plan.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::invalidation::EntityId;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";

/// Meta keys whose change alters rendered price or availability.
pub const PRICE_META_KEYS: [&str; 6] = [
    "_price",
    "_regular_price",
    "_sale_price",
    "_stock",
    "_stock_status",
    "_tax_class",
];

/// Monotonic per-process sequence number.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Idempotency key; duplicates within one batch are dropped.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    EntitySaved { id: EntityId },
    EntityDeleted { id: EntityId },
    EntityStatusChanged {
        id: EntityId,
        from: String,
        to: String,
    },
    /// Stock level or price changed outside a full save.
    StockChanged { id: EntityId },
    MetaUpdated { id: EntityId, key: String },
    /// Menus, theme, customizer, scheduled sales.
    GlobalChanged { reason: String },
}

impl EventKind {
    /// Entity whose pages this event makes stale, if any.
    pub fn affected_entity(&self) -> Option<EntityId> {
        match self {
            EventKind::EntitySaved { id }
            | EventKind::EntityDeleted { id }
            | EventKind::EntityStatusChanged { id, .. }
            | EventKind::StockChanged { id } => Some(*id),
            EventKind::MetaUpdated { id, key } => {
                PRICE_META_KEYS.contains(&key.as_str()).then_some(*id)
            }
            EventKind::GlobalChanged { .. } => None,
        }
    }
}

/// In-memory FIFO of pending change events.
pub struct EventQueue {
    queue: Mutex<VecDeque<ChangeEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(&self, kind: EventKind) {
        let event = ChangeEvent::new(kind, self.next_epoch());
        info!(
            target = SOURCE,
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Change event enqueued"
        );
        mutex_lock(&self.queue, SOURCE, "publish").push_back(event);
    }

    pub fn drain(&self, limit: usize) -> Vec<ChangeEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn epochs_increase() {
        let queue = EventQueue::new();
        let first = queue.next_epoch();
        let second = queue.next_epoch();
        assert!(first < second);
    }

    #[test]
    fn drain_is_fifo_and_bounded() {
        let queue = EventQueue::new();
        queue.publish(EventKind::EntitySaved { id: 1 });
        queue.publish(EventKind::GlobalChanged {
            reason: "menu".to_string(),
        });
        queue.publish(EventKind::StockChanged { id: 2 });

        let events = queue.drain(2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::EntitySaved { id: 1 });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(100).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn only_price_and_stock_meta_affects_pages() {
        let price = EventKind::MetaUpdated {
            id: 7,
            key: "_sale_price".to_string(),
        };
        let cosmetic = EventKind::MetaUpdated {
            id: 7,
            key: "_edit_lock".to_string(),
        };
        assert_eq!(price.affected_entity(), Some(7));
        assert_eq!(cosmetic.affected_entity(), None);
        assert_eq!(
            EventKind::EntityStatusChanged {
                id: 3,
                from: "draft".to_string(),
                to: "publish".to_string(),
            }
            .affected_entity(),
            Some(3)
        );
    }

    #[test]
    fn queue_survives_poisoned_lock() {
        let queue = EventQueue::new();
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));
        queue.publish(EventKind::EntityDeleted { id: 9 });
        assert_eq!(queue.len(), 1);
    }
}
