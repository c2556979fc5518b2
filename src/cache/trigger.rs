//! Change notification entry points for the host.

use std::sync::Arc;

use tracing::debug;

use super::consumer::PurgeConsumer;
use super::events::{EventKind, EventQueue, PRICE_META_KEYS};
use super::invalidation::{EntityId, PurgeReport};

/// Publishes change events and, by default, purges right away.
///
/// ```ignore
/// // After the host persisted entity 42:
/// trigger.entity_saved(42);
/// ```
pub struct CacheTrigger {
    queue: Arc<EventQueue>,
    consumer: Arc<PurgeConsumer>,
}

impl CacheTrigger {
    pub fn new(queue: Arc<EventQueue>, consumer: Arc<PurgeConsumer>) -> Self {
        Self { queue, consumer }
    }

    pub fn consumer(&self) -> &Arc<PurgeConsumer> {
        &self.consumer
    }

    /// Queue `kind`; with `consume_now` the pending batch is purged before
    /// returning.
    pub fn trigger(&self, kind: EventKind, consume_now: bool) -> Option<PurgeReport> {
        self.queue.publish(kind);
        if consume_now {
            self.consumer.consume()
        } else {
            None
        }
    }

    pub fn entity_saved(&self, id: EntityId) -> Option<PurgeReport> {
        self.trigger(EventKind::EntitySaved { id }, true)
    }

    pub fn entity_deleted(&self, id: EntityId) -> Option<PurgeReport> {
        self.trigger(EventKind::EntityDeleted { id }, true)
    }

    pub fn entity_status_changed(&self, id: EntityId, from: &str, to: &str) -> Option<PurgeReport> {
        self.trigger(
            EventKind::EntityStatusChanged {
                id,
                from: from.to_string(),
                to: to.to_string(),
            },
            true,
        )
    }

    pub fn stock_changed(&self, id: EntityId) -> Option<PurgeReport> {
        self.trigger(EventKind::StockChanged { id }, true)
    }

    /// Only price and stock keys reach the queue.
    pub fn meta_updated(&self, id: EntityId, key: &str) -> Option<PurgeReport> {
        if !PRICE_META_KEYS.contains(&key) {
            debug!(entity_id = id, meta_key = key, "Meta change ignored");
            return None;
        }
        self.trigger(
            EventKind::MetaUpdated {
                id,
                key: key.to_string(),
            },
            true,
        )
    }

    pub fn global_changed(&self, reason: &str) -> Option<PurgeReport> {
        self.trigger(
            EventKind::GlobalChanged {
                reason: reason.to_string(),
            },
            true,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::cache::error::CacheError;
    use crate::cache::invalidation::{ContentSource, Invalidator};
    use crate::cache::keys::{CacheKey, Variant, normalize_url};
    use crate::cache::store::SnapshotStore;

    struct OnePost;

    impl ContentSource for OnePost {
        fn site_root(&self) -> String {
            "https://example.com/".to_string()
        }

        fn canonical_url(&self, id: EntityId) -> Result<Option<String>, CacheError> {
            Ok((id == 1).then(|| "https://example.com/hello/".to_string()))
        }

        fn entity_kind(&self, _id: EntityId) -> Result<Option<String>, CacheError> {
            Ok(None)
        }

        fn archive_url(&self, _kind: &str) -> Result<Option<String>, CacheError> {
            Ok(None)
        }

        fn term_urls(&self, _id: EntityId) -> Result<Vec<String>, CacheError> {
            Ok(Vec::new())
        }
    }

    fn setup(dir: &TempDir) -> (CacheTrigger, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::new());
        let invalidator = Invalidator::new(Arc::new(OnePost), SnapshotStore::new(dir.path()), 2);
        let consumer = Arc::new(PurgeConsumer::new(queue.clone(), invalidator));
        (CacheTrigger::new(queue.clone(), consumer), queue)
    }

    fn plant(dir: &TempDir, url: &str) -> std::path::PathBuf {
        let key = CacheKey::derive(&normalize_url(url).unwrap());
        let path = key.snapshot_path(Variant::Gzip, dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn save_purges_immediately() {
        let dir = TempDir::new().unwrap();
        let (trigger, queue) = setup(&dir);
        let post = plant(&dir, "https://example.com/hello/");
        let home = plant(&dir, "https://example.com/");

        let report = trigger.entity_saved(1).expect("queue had an event");
        assert_eq!(report.urls, 4);
        assert_eq!(report.files_removed, 2);
        assert!(!post.exists());
        assert!(!home.exists());
        assert!(queue.is_empty());
    }

    #[test]
    fn deferred_events_are_merged_into_one_plan() {
        let dir = TempDir::new().unwrap();
        let (trigger, _queue) = setup(&dir);
        assert!(trigger.trigger(EventKind::EntitySaved { id: 1 }, false).is_none());
        assert!(trigger.trigger(EventKind::StockChanged { id: 1 }, false).is_none());
        let report = trigger.consumer().consume().expect("two events pending");
        assert_eq!(report.urls, 4);
        assert!(trigger.consumer().consume().is_none());
    }

    #[test]
    fn cosmetic_meta_never_queues() {
        let dir = TempDir::new().unwrap();
        let (trigger, queue) = setup(&dir);
        assert!(trigger.meta_updated(1, "_edit_last").is_none());
        assert!(queue.is_empty());
        assert!(trigger.meta_updated(1, "_stock_status").is_some());
    }
}
