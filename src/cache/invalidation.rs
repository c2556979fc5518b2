//! Invalidation fan-out.
//!
//! Resolves a change to the set of URLs whose snapshots embed it and deletes
//! every variant of each. Resolution is deliberately generous: purging a page
//! that did not change only costs a re-render.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use tracing::{info, warn};

use super::error::CacheError;
use super::keys::{CacheKey, NormalizedUrl, normalize_url, trailing_slash};
use super::store::SnapshotStore;

const TARGET: &str = "cache::invalidation";

pub const METRIC_PURGE_URLS_TOTAL: &str = "snapcache_purge_urls_total";
pub const METRIC_PURGE_FILES_TOTAL: &str = "snapcache_purge_files_total";

pub type EntityId = u64;

/// Read-only view of the content store.
///
/// Every lookup may fail independently; a failed lookup drops that URL from
/// the fan-out and the rest still proceeds.
pub trait ContentSource: Send + Sync {
    /// Absolute URL of the site root.
    fn site_root(&self) -> String;

    /// Canonical URL of an entity, `None` when it has none (unknown, or no
    /// public permalink).
    fn canonical_url(&self, id: EntityId) -> Result<Option<String>, CacheError>;

    /// Content type of an entity.
    fn entity_kind(&self, id: EntityId) -> Result<Option<String>, CacheError>;

    /// Listing page for every entity of `kind`, if the type has one.
    fn archive_url(&self, kind: &str) -> Result<Option<String>, CacheError>;

    /// Canonical URLs of the taxonomy terms attached to an entity.
    fn term_urls(&self, id: EntityId) -> Result<Vec<String>, CacheError>;

    /// Site-wide listing purged with the root on global changes.
    fn global_archive_url(&self) -> Result<Option<String>, CacheError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub urls: usize,
    pub files_removed: usize,
    pub errors: usize,
}

impl PurgeReport {
    pub fn merge(&mut self, other: PurgeReport) {
        self.urls += other.urls;
        self.files_removed += other.files_removed;
        self.errors += other.errors;
    }
}

impl fmt::Display for PurgeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PurgeReport {{ urls: {}, files_removed: {}, errors: {} }}",
            self.urls, self.files_removed, self.errors
        )
    }
}

#[derive(Clone)]
pub struct Invalidator {
    source: Arc<dyn ContentSource>,
    store: SnapshotStore,
    archive_page_count: u32,
}

impl fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invalidator")
            .field("store", &self.store)
            .field("archive_page_count", &self.archive_page_count)
            .finish_non_exhaustive()
    }
}

impl Invalidator {
    pub fn new(source: Arc<dyn ContentSource>, store: SnapshotStore, archive_page_count: u32) -> Self {
        Self {
            source,
            store,
            archive_page_count,
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Every URL whose snapshot may embed entity `id`.
    ///
    /// Canonical URL, site root, type archive and term listings, each followed
    /// by its paginated pages `page/2/` through `page/N/`. Deduplicated in
    /// first-seen order.
    pub fn urls_for_entity(&self, id: EntityId) -> Vec<NormalizedUrl> {
        let mut bases: Vec<String> = Vec::new();

        if let Some(url) = self.lookup(id, "canonical_url", self.source.canonical_url(id)) {
            bases.extend(url);
        }
        bases.push(self.source.site_root());

        let kind = self.lookup(id, "entity_kind", self.source.entity_kind(id)).flatten();
        if let Some(kind) = kind
            && let Some(url) = self.lookup(id, "archive_url", self.source.archive_url(&kind))
        {
            bases.extend(url);
        }
        if let Some(terms) = self.lookup(id, "term_urls", self.source.term_urls(id)) {
            bases.extend(terms);
        }

        let bases: Vec<String> = bases
            .into_iter()
            .filter(|url| !url.trim().is_empty())
            .map(|url| trailing_slash(url.trim()))
            .collect();

        let mut expanded = bases.clone();
        for base in &bases {
            for page in 2..=self.archive_page_count {
                expanded.push(format!("{base}page/{page}/"));
            }
        }

        dedupe_normalized(expanded)
    }

    pub fn invalidate_by_entity(&self, id: EntityId) -> PurgeReport {
        let started_at = Instant::now();
        let urls = self.urls_for_entity(id);
        let report = self.purge_urls(&urls);
        info!(
            target = TARGET,
            op = "invalidate_by_entity",
            result = "ok",
            entity_id = id,
            report = %report,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Entity snapshots purged"
        );
        report
    }

    /// Purge the site root and the global listing.
    pub fn invalidate_global(&self) -> PurgeReport {
        let mut urls = vec![trailing_slash(&self.source.site_root())];
        match self.source.global_archive_url() {
            Ok(Some(url)) => urls.push(trailing_slash(&url)),
            Ok(None) => {}
            Err(err) => warn!(
                target = TARGET,
                op = "invalidate_global",
                result = "lookup_error",
                error = %err,
                "Global archive lookup failed; skipping it"
            ),
        }
        let report = self.purge_urls(&dedupe_normalized(urls));
        info!(
            target = TARGET,
            op = "invalidate_global",
            result = "ok",
            report = %report,
            "Global snapshots purged"
        );
        report
    }

    pub fn invalidate_by_url(&self, url: &str) -> Result<PurgeReport, CacheError> {
        let url = normalize_url(url)?;
        Ok(self.purge_urls(std::slice::from_ref(&url)))
    }

    /// Remove the whole tree.
    pub fn purge_all(&self) -> Result<(), CacheError> {
        self.store.clear()?;
        counter!(METRIC_PURGE_URLS_TOTAL, "scope" => "all").increment(1);
        info!(
            target = TARGET,
            op = "purge_all",
            result = "ok",
            base = %self.store.base().display(),
            "Snapshot tree cleared"
        );
        Ok(())
    }

    pub fn purge_urls(&self, urls: &[NormalizedUrl]) -> PurgeReport {
        let mut report = PurgeReport::default();
        for url in urls {
            report.urls += 1;
            match self.store.remove_entry(&CacheKey::derive(url)) {
                Ok(removed) => report.files_removed += removed,
                Err(err) => {
                    report.errors += 1;
                    warn!(
                        target = TARGET,
                        op = "purge_url",
                        result = "error",
                        url = %url,
                        error = %err,
                        "Snapshot purge failed"
                    );
                }
            }
        }
        counter!(METRIC_PURGE_URLS_TOTAL, "scope" => "url").increment(report.urls as u64);
        counter!(METRIC_PURGE_FILES_TOTAL).increment(report.files_removed as u64);
        report
    }

    fn lookup<T>(&self, id: EntityId, what: &'static str, result: Result<T, CacheError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "urls_for_entity",
                    result = "lookup_error",
                    entity_id = id,
                    lookup = what,
                    error = %err,
                    "Content lookup failed; skipping URL"
                );
                None
            }
        }
    }
}

fn dedupe_normalized(urls: Vec<String>) -> Vec<NormalizedUrl> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(urls.len());
    for url in urls {
        match normalize_url(&url) {
            Ok(normalized) => {
                if seen.insert(normalized.clone()) {
                    out.push(normalized);
                }
            }
            Err(err) => warn!(
                target = TARGET,
                op = "normalize",
                result = "skipped",
                url = %url,
                error = %err,
                "Unusable URL dropped from fan-out"
            ),
        }
    }
    out
}
