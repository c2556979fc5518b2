//! Executes purge plans against the snapshot tree.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{info, instrument};
use uuid::Uuid;

use super::events::EventQueue;
use super::invalidation::{Invalidator, PurgeReport};
use super::planner::PurgePlan;

pub const METRIC_CONSUME_MS: &str = "snapcache_consume_ms";

/// Upper bound on events merged into one plan.
pub const CONSUME_BATCH_LIMIT: usize = 512;

pub struct PurgeConsumer {
    queue: Arc<EventQueue>,
    invalidator: Invalidator,
}

impl PurgeConsumer {
    pub fn new(queue: Arc<EventQueue>, invalidator: Invalidator) -> Self {
        Self { queue, invalidator }
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    /// Drain pending events and purge what they touched.
    ///
    /// Returns `None` when the queue was empty.
    #[instrument(skip(self))]
    pub fn consume(&self) -> Option<PurgeReport> {
        let started_at = Instant::now();
        let events = self.queue.drain(CONSUME_BATCH_LIMIT);
        if events.is_empty() {
            return None;
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = PurgePlan::from_events(events);
        info!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Purge consumption starting"
        );

        let mut report = PurgeReport::default();
        for id in &plan.entities {
            report.merge(self.invalidator.invalidate_by_entity(*id));
        }
        if plan.global {
            report.merge(self.invalidator.invalidate_global());
        }

        info!(event_count, report = %report, "Purge consumption complete");
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        Some(report)
    }
}
