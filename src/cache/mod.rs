//! Snapshot cache engine.
//!
//! Full-page HTML snapshots for anonymous visitors, stored on disk under a
//! two-level shard tree:
//!
//! - **Read path**: [`EarlyReader`] answers before the host runs.
//! - **Write path**: [`CacheabilityPolicy`] gates, [`SnapshotWriter`] stores.
//! - **Invalidation**: [`CacheTrigger`] → [`PurgePlan`] → [`Invalidator`].
//! - **Quota**: [`sweep`] evicts oldest files past the byte budget.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! base_directory = "cache/html-snapshots"
//! variants = ["gzip", "brotli"]
//! archive_page_count = 3
//! max_total_bytes = 1073741824
//! # ... see config.rs for all options
//! ```

mod config;
mod consumer;
pub mod dropin;
mod early;
mod error;
mod events;
mod invalidation;
mod keys;
mod lock;
mod middleware;
mod planner;
mod policy;
mod request;
mod store;
mod sweep;
mod trigger;
mod writer;

pub use config::{
    CacheConfig, DEFAULT_ARCHIVE_PAGES, DEFAULT_BASE_DIR, DEFAULT_MAX_TOTAL_BYTES,
    DEFAULT_MIN_SNAPSHOT_BYTES, DEFAULT_NO_CACHE_PATHS, DEFAULT_SESSION_COOKIE_PREFIXES,
    DEFAULT_SWEEP_INTERVAL_SECS,
};
pub use consumer::PurgeConsumer;
pub use dropin::{DropinInstaller, DropinState, DropinStatus, EarlyServeManifest, Presence};
pub use early::{EarlyOutcome, EarlyReader, EarlySettings, format_http_date, parse_http_date};
pub use error::CacheError;
pub use events::{ChangeEvent, Epoch, EventKind, EventQueue, PRICE_META_KEYS};
pub use invalidation::{ContentSource, EntityId, Invalidator, PurgeReport};
pub use keys::{
    CacheKey, KEY_ALGORITHM_VERSION, KeyError, NormalizedUrl, Variant, normalize_parts,
    normalize_path, normalize_url, trailing_slash,
};
pub use middleware::{
    CaptureState, EarlyServeState, HIT_CACHE_CONTROL, HIT_VARY, HTML_CONTENT_TYPE, capture_layer,
    early_serve_layer, install_layers,
};
pub use planner::PurgePlan;
pub use policy::{
    CacheabilityPolicy, CriticalView, Decision, PolicyInput, PolicyOverride, ReasonCode, ViewKind,
};
pub use request::RequestFacts;
pub use store::{DirFailure, SnapshotStore};
pub use sweep::{SnapshotFile, SnapshotWalk, SweepReport, spawn_quota_sweeper, sweep, total_size};
pub use trigger::CacheTrigger;
pub use writer::{SnapshotWriter, WriteReport};

/// Metric names emitted by the engine, for exporters and descriptions.
pub mod metric_names {
    pub use super::consumer::METRIC_CONSUME_MS;
    pub use super::early::METRIC_EARLY_TOTAL;
    pub use super::invalidation::{METRIC_PURGE_FILES_TOTAL, METRIC_PURGE_URLS_TOTAL};
    pub use super::sweep::{METRIC_SWEEP_EVICTED_TOTAL, METRIC_SWEEP_MS};
    pub use super::writer::{METRIC_WRITE_MS, METRIC_WRITE_TOTAL};
}
