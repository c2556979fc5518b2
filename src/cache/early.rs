//! Early-serve reader.
//!
//! Runs ahead of the host application. It only needs [`EarlySettings`], which
//! the bootstrap manifest carries, and the shared key deriver; nothing else
//! from the engine is consulted. The reader never writes except to unlink
//! zero-byte leftovers, and never takes a lock.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use metrics::counter;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::keys::{CacheKey, KEY_ALGORITHM_VERSION, Variant};
use super::policy::{CART_HASH_COOKIE, CART_ITEMS_COOKIE, is_critical_path};
use super::request::RequestFacts;

const TARGET: &str = "cache::early";

pub const METRIC_EARLY_TOTAL: &str = "snapcache_early_total";

/// RFC 7231 IMF-fixdate.
const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// What the early reader needs to know, and nothing more.
#[derive(Debug, Clone)]
pub struct EarlySettings {
    pub base_directory: PathBuf,
    pub min_snapshot_bytes: u64,
    pub debug_headers: bool,
    pub session_cookie_prefixes: Vec<String>,
    /// Key algorithm the snapshots on disk were written with.
    pub key_algorithm: u32,
}

impl From<&CacheConfig> for EarlySettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            base_directory: config.base_directory.clone(),
            min_snapshot_bytes: config.min_snapshot_bytes,
            debug_headers: config.debug_headers,
            session_cookie_prefixes: config.session_cookie_prefixes.clone(),
            key_algorithm: KEY_ALGORITHM_VERSION,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EarlyOutcome {
    /// The gate refused; the host handles the request untouched.
    Bypass,
    /// No valid snapshot; the host renders and the writer captures.
    Miss { key: CacheKey, dir: PathBuf },
    /// The client copy is still current.
    NotModified {
        key: CacheKey,
        dir: PathBuf,
        last_modified: OffsetDateTime,
    },
    Hit {
        key: CacheKey,
        dir: PathBuf,
        variant: Variant,
        body: Bytes,
        last_modified: OffsetDateTime,
    },
}

impl EarlyOutcome {
    /// Value of `X-FS-Early-Result`; bypasses carry none.
    pub fn result_header(&self) -> Option<&'static str> {
        match self {
            EarlyOutcome::Bypass => None,
            EarlyOutcome::Miss { .. } => Some("miss"),
            EarlyOutcome::NotModified { .. } => Some("not-modified"),
            EarlyOutcome::Hit {
                variant: Variant::Brotli,
                ..
            } => Some("hit-br"),
            EarlyOutcome::Hit { .. } => Some("hit-gz"),
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            EarlyOutcome::Bypass => None,
            EarlyOutcome::Miss { key, .. }
            | EarlyOutcome::NotModified { key, .. }
            | EarlyOutcome::Hit { key, .. } => Some(key),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        match self {
            EarlyOutcome::Bypass => None,
            EarlyOutcome::Miss { dir, .. }
            | EarlyOutcome::NotModified { dir, .. }
            | EarlyOutcome::Hit { dir, .. } => Some(dir),
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            EarlyOutcome::Bypass => "bypass",
            EarlyOutcome::Miss { .. } => "miss",
            EarlyOutcome::NotModified { .. } => "not_modified",
            EarlyOutcome::Hit { .. } => "hit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EarlyReader {
    settings: EarlySettings,
}

impl EarlyReader {
    pub fn new(settings: EarlySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EarlySettings {
        &self.settings
    }

    /// The cheap gate: safe method, no session, no query, no transaction.
    pub fn allows(&self, request: &RequestFacts) -> bool {
        request.is_safe_method()
            && !request.has_cookie_with_prefix(&self.settings.session_cookie_prefixes)
            && !is_critical_path(&request.path)
            && !request.has_query()
            && !request
                .cookie(CART_ITEMS_COOKIE)
                .is_some_and(|value| !value.is_empty())
            && !request
                .cookie(CART_HASH_COOKIE)
                .is_some_and(|value| !value.is_empty())
    }

    pub fn lookup(&self, request: &RequestFacts) -> EarlyOutcome {
        let outcome = self.resolve(request);
        counter!(METRIC_EARLY_TOTAL, "result" => outcome.metric_label()).increment(1);
        debug!(
            target = TARGET,
            op = "lookup",
            result = outcome.metric_label(),
            path = %request.path,
            key_prefix = outcome.key().map(CacheKey::diagnostic_prefix).unwrap_or("-"),
            "Early-serve lookup"
        );
        outcome
    }

    fn resolve(&self, request: &RequestFacts) -> EarlyOutcome {
        if self.settings.key_algorithm != KEY_ALGORITHM_VERSION {
            warn!(
                target = TARGET,
                op = "lookup",
                result = "bypass",
                manifest_key_algorithm = self.settings.key_algorithm,
                engine_key_algorithm = KEY_ALGORITHM_VERSION,
                "Snapshot key algorithm mismatch; early serving disabled"
            );
            return EarlyOutcome::Bypass;
        }
        if !self.allows(request) {
            return EarlyOutcome::Bypass;
        }
        let Ok(url) = request.normalized_url() else {
            return EarlyOutcome::Bypass;
        };

        let base = &self.settings.base_directory;
        let key = CacheKey::derive(&url);
        let dir = key.shard_dir(base);

        for variant in Variant::SERVE_PRIORITY {
            let Some(token) = variant.content_encoding() else {
                continue;
            };
            if !request.accepts_encoding(token) {
                continue;
            }
            let path = key.snapshot_path(variant, base);
            let Some(last_modified) = self.valid_snapshot_mtime(&path) else {
                continue;
            };

            if is_not_modified(request.if_modified_since.as_deref(), last_modified) {
                return EarlyOutcome::NotModified {
                    key,
                    dir,
                    last_modified,
                };
            }

            match fs::read(&path) {
                // A rename may have swapped the file since the size check.
                Ok(body) if body.len() as u64 > self.settings.min_snapshot_bytes => {
                    return EarlyOutcome::Hit {
                        key,
                        dir,
                        variant,
                        body: Bytes::from(body),
                        last_modified,
                    };
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        target = TARGET,
                        op = "lookup",
                        result = "read_error",
                        path = %path.display(),
                        error = %err,
                        "Snapshot read failed; trying next variant"
                    );
                }
            }
        }

        remove_empty_variants(&key, base);
        EarlyOutcome::Miss { key, dir }
    }

    /// A candidate is valid when it is a file strictly above the threshold.
    fn valid_snapshot_mtime(&self, path: &Path) -> Option<OffsetDateTime> {
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() || metadata.len() <= self.settings.min_snapshot_bytes {
            return None;
        }
        let modified = metadata.modified().ok()?;
        Some(truncate_to_seconds(modified))
    }
}

fn remove_empty_variants(key: &CacheKey, base: &Path) {
    for variant in Variant::ALL {
        let path = key.snapshot_path(variant, base);
        let Ok(metadata) = fs::metadata(&path) else {
            continue;
        };
        if metadata.is_file() && metadata.len() == 0 {
            match fs::remove_file(&path) {
                Ok(()) => debug!(
                    target = TARGET,
                    op = "self_heal",
                    result = "removed",
                    path = %path.display(),
                    "Removed zero-byte snapshot"
                ),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(
                    target = TARGET,
                    op = "self_heal",
                    result = "error",
                    path = %path.display(),
                    error = %err,
                    "Failed to remove zero-byte snapshot"
                ),
            }
        }
    }
}

fn truncate_to_seconds(time: SystemTime) -> OffsetDateTime {
    let time = OffsetDateTime::from(time);
    time.replace_nanosecond(0).unwrap_or(time)
}

fn is_not_modified(if_modified_since: Option<&str>, last_modified: OffsetDateTime) -> bool {
    if_modified_since
        .and_then(parse_http_date)
        .is_some_and(|since| since >= last_modified)
}

pub fn format_http_date(time: OffsetDateTime) -> String {
    time.to_offset(time::UtcOffset::UTC)
        .format(HTTP_DATE)
        .unwrap_or_default()
}

pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

#[cfg(test)]
mod tests {
    use axum::http::Request;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::keys::normalize_parts;

    fn facts(uri: &str, headers: &[(&str, &str)]) -> RequestFacts {
        let mut builder = Request::builder().uri(uri).header("Host", "example.com");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        RequestFacts::from_parts(&parts, "https")
    }

    fn reader(dir: &TempDir) -> EarlyReader {
        EarlyReader::new(EarlySettings::from(&CacheConfig {
            base_directory: dir.path().to_path_buf(),
            ..Default::default()
        }))
    }

    fn plant(dir: &TempDir, path: &str, variant: Variant, bytes: &[u8]) -> PathBuf {
        let key = CacheKey::derive(&normalize_parts("https", "example.com", path).unwrap());
        let file = key.snapshot_path(variant, dir.path());
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, bytes).unwrap();
        file
    }

    #[test]
    fn brotli_wins_when_both_are_valid_and_accepted() {
        let dir = TempDir::new().unwrap();
        plant(&dir, "/about-us/", Variant::Gzip, &[1; 2048]);
        plant(&dir, "/about-us/", Variant::Brotli, &[2; 2048]);

        let outcome = reader(&dir).lookup(&facts("/about-us", &[("Accept-Encoding", "gzip, br")]));
        assert_eq!(outcome.result_header(), Some("hit-br"));
        let EarlyOutcome::Hit { body, variant, .. } = outcome else {
            panic!("expected hit");
        };
        assert_eq!(variant, Variant::Brotli);
        assert_eq!(body.len(), 2048);
    }

    #[test]
    fn gzip_served_when_brotli_not_accepted() {
        let dir = TempDir::new().unwrap();
        plant(&dir, "/about-us/", Variant::Gzip, &[1; 2048]);
        plant(&dir, "/about-us/", Variant::Brotli, &[2; 2048]);

        let outcome = reader(&dir).lookup(&facts("/about-us", &[("Accept-Encoding", "gzip")]));
        assert_eq!(outcome.result_header(), Some("hit-gz"));
    }

    #[test]
    fn raw_html_is_never_served_early() {
        let dir = TempDir::new().unwrap();
        plant(&dir, "/", Variant::Raw, &[b'a'; 4096]);
        let outcome = reader(&dir).lookup(&facts("/", &[("Accept-Encoding", "gzip, br")]));
        assert_eq!(outcome.result_header(), Some("miss"));
    }

    #[test]
    fn undersized_snapshot_is_a_miss() {
        let dir = TempDir::new().unwrap();
        plant(&dir, "/small/", Variant::Gzip, &[1; 1024]);
        let outcome = reader(&dir).lookup(&facts("/small/", &[("Accept-Encoding", "gzip")]));
        assert!(matches!(outcome, EarlyOutcome::Miss { .. }));
    }

    #[test]
    fn zero_byte_snapshot_is_removed_on_miss() {
        let dir = TempDir::new().unwrap();
        let gz = plant(&dir, "/empty/", Variant::Gzip, b"");
        let html = plant(&dir, "/empty/", Variant::Raw, b"");

        let outcome = reader(&dir).lookup(&facts("/empty/", &[("Accept-Encoding", "gzip")]));
        assert!(matches!(outcome, EarlyOutcome::Miss { .. }));
        assert!(!gz.exists());
        assert!(!html.exists());
    }

    #[test]
    fn if_modified_since_yields_not_modified() {
        let dir = TempDir::new().unwrap();
        plant(&dir, "/fresh/", Variant::Gzip, &[1; 2048]);
        let future = format_http_date(OffsetDateTime::now_utc() + time::Duration::hours(1));
        let past = "Mon, 01 Jan 2001 00:00:00 GMT";

        let outcome = reader(&dir).lookup(&facts(
            "/fresh/",
            &[("Accept-Encoding", "gzip"), ("If-Modified-Since", future.as_str())],
        ));
        assert_eq!(outcome.result_header(), Some("not-modified"));

        let outcome = reader(&dir).lookup(&facts(
            "/fresh/",
            &[("Accept-Encoding", "gzip"), ("If-Modified-Since", past)],
        ));
        assert_eq!(outcome.result_header(), Some("hit-gz"));
    }

    #[test]
    fn gate_bypasses_sessions_queries_and_transactions() {
        let dir = TempDir::new().unwrap();
        plant(&dir, "/", Variant::Gzip, &[1; 2048]);
        let reader = reader(&dir);

        for request in [
            facts("/", &[("Cookie", "wordpress_logged_in_123=abc")]),
            facts("/?p=1", &[]),
            facts("/checkout/", &[]),
            facts("/My-Account", &[]),
            facts("/", &[("Cookie", "woocommerce_items_in_cart=1")]),
            facts("/", &[("Cookie", "woocommerce_cart_hash=h")]),
        ] {
            assert!(matches!(reader.lookup(&request), EarlyOutcome::Bypass));
        }

        let (parts, _) = Request::builder()
            .method("POST")
            .uri("/")
            .header("Host", "example.com")
            .body(())
            .unwrap()
            .into_parts();
        let post = RequestFacts::from_parts(&parts, "https");
        assert!(matches!(reader.lookup(&post), EarlyOutcome::Bypass));

        // An empty cart cookie does not block the gate.
        assert!(reader.allows(&facts("/", &[("Cookie", "woocommerce_items_in_cart=")])));
    }

    #[test]
    fn mismatched_key_algorithm_bypasses() {
        let dir = TempDir::new().unwrap();
        plant(&dir, "/", Variant::Gzip, &[1; 2048]);
        let mut settings = reader(&dir).settings().clone();
        settings.key_algorithm = KEY_ALGORITHM_VERSION + 1;
        let outcome = EarlyReader::new(settings).lookup(&facts("/", &[("Accept-Encoding", "gzip")]));
        assert!(matches!(outcome, EarlyOutcome::Bypass));
    }

    #[test]
    fn http_dates_round_trip() {
        let date = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(format_http_date(date), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(parse_http_date("yesterday").is_none());
    }
}
