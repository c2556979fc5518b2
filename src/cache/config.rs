//! Cache configuration.
//!
//! A resolved, validated value built once from [`crate::config::Settings`] and
//! handed to every component explicitly.

use std::path::PathBuf;
use std::time::Duration;

use super::keys::Variant;

pub const DEFAULT_BASE_DIR: &str = "cache/html-snapshots";
pub const DEFAULT_ARCHIVE_PAGES: u32 = 3;
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 1_073_741_824;
pub const DEFAULT_MIN_SNAPSHOT_BYTES: u64 = 1024;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 86_400;
pub const DEFAULT_NO_CACHE_PATHS: [&str; 2] = ["/free-estimates/", "/contact/"];
pub const DEFAULT_SESSION_COOKIE_PREFIXES: [&str; 2] = ["wordpress_logged_in_", "snapcache_session"];

/// Cache engine configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Root of the shard tree.
    pub base_directory: PathBuf,
    /// Encodings written by the capture path, in write order.
    pub variants: Vec<Variant>,
    /// Archive pages purged alongside each listing (`page/2/` .. `page/N/`).
    pub archive_page_count: u32,
    /// Disk budget for the sweep; zero disables it.
    pub max_total_bytes: u64,
    /// Emit `X-FS-*` diagnostic headers.
    pub debug_headers: bool,
    /// Request URI substrings that are never cached.
    pub no_cache_path_substrings: Vec<String>,
    /// Snapshots must be strictly larger than this to be served early.
    pub min_snapshot_bytes: u64,
    /// Cookie name prefixes that identify a signed-in session.
    pub session_cookie_prefixes: Vec<String>,
    /// Cadence of the periodic quota sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from(DEFAULT_BASE_DIR),
            variants: vec![Variant::Gzip],
            archive_page_count: DEFAULT_ARCHIVE_PAGES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            debug_headers: true,
            no_cache_path_substrings: DEFAULT_NO_CACHE_PATHS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_snapshot_bytes: DEFAULT_MIN_SNAPSHOT_BYTES,
            session_cookie_prefixes: DEFAULT_SESSION_COOKIE_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            base_directory: settings.base_directory.clone(),
            variants: settings.variants.clone(),
            archive_page_count: settings.archive_page_count.get(),
            max_total_bytes: settings.max_total_bytes,
            debug_headers: settings.debug_headers,
            no_cache_path_substrings: settings.no_cache_path_substrings.clone(),
            min_snapshot_bytes: settings.min_snapshot_bytes,
            session_cookie_prefixes: settings.session_cookie_prefixes.clone(),
            sweep_interval: settings.sweep_interval,
        }
    }
}

impl CacheConfig {
    /// Returns true when the quota sweep has a budget to enforce.
    pub fn quota_enabled(&self) -> bool {
        self.max_total_bytes > 0
    }
}
