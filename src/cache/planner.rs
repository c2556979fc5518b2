//! Purge planning.
//!
//! Merges a batch of change events into the minimal set of fan-out calls.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use super::events::{ChangeEvent, EventKind};
use super::invalidation::EntityId;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgePlan {
    /// Entities to fan out, each once.
    pub entities: BTreeSet<EntityId>,
    /// Whether the site root and global listing must go.
    pub global: bool,
    /// Why a global purge was requested.
    pub global_reasons: BTreeSet<String>,
    /// Events that changed nothing cacheable.
    pub ignored: usize,
}

impl fmt::Display for PurgePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PurgePlan {{ entities: {}, global: {}, ignored: {} }}",
            self.entities.len(),
            self.global,
            self.ignored
        )
    }
}

impl PurgePlan {
    /// Deduplicate by event id, then collapse to one entry per entity.
    ///
    /// Saves and deletions resolve to the same URLs, so the latest state of an
    /// entity does not matter here.
    pub fn from_events(events: Vec<ChangeEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();

        for event in events.into_iter().filter(|e| seen_ids.insert(e.id)) {
            if let EventKind::GlobalChanged { reason } = &event.kind {
                plan.global = true;
                plan.global_reasons.insert(reason.clone());
                continue;
            }
            match event.kind.affected_entity() {
                Some(id) => {
                    plan.entities.insert(id);
                }
                None => plan.ignored += 1,
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && !self.global
    }
}
