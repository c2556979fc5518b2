//! Capture and store.
//!
//! Turns one rendered page into up to three sibling snapshot files. Every
//! failure is contained here: the caller gets a [`WriteReport`] and the
//! response it already holds is never affected.

use std::io::{Cursor, Write};
use std::time::Instant;

use flate2::Compression;
use flate2::write::GzEncoder;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use metrics::{counter, histogram};
use tracing::{info, warn};

use super::config::CacheConfig;
use super::error::CacheError;
use super::keys::{CacheKey, NormalizedUrl, Variant};
use super::store::{DirFailure, SnapshotStore};

const TARGET: &str = "cache::writer";

pub const GZIP_LEVEL: u32 = 6;
pub const BROTLI_QUALITY: i32 = 5;
const BROTLI_WINDOW: i32 = 22;

pub const METRIC_WRITE_TOTAL: &str = "snapcache_write_total";
pub const METRIC_WRITE_MS: &str = "snapcache_write_ms";

/// Result of one capture.
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub key: CacheKey,
    pub written: Vec<Variant>,
    pub failed: Vec<(Variant, String)>,
    pub dir_failure: Option<DirFailure>,
}

impl WriteReport {
    fn new(key: CacheKey) -> Self {
        Self {
            key,
            written: Vec::new(),
            failed: Vec::new(),
            dir_failure: None,
        }
    }

    /// True when at least one variant reached its final name.
    pub fn wrote_any(&self) -> bool {
        !self.written.is_empty()
    }

    pub fn wrote_header(&self) -> &'static str {
        if self.wrote_any() { "yes" } else { "no" }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    store: SnapshotStore,
    variants: Vec<Variant>,
}

impl SnapshotWriter {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            store: SnapshotStore::new(config.base_directory.clone()),
            variants: config.variants.clone(),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Persist `html` for `url` in every configured variant.
    ///
    /// A failing variant is logged and skipped; the others are still written.
    pub fn write(&self, url: &NormalizedUrl, html: &str) -> WriteReport {
        let started_at = Instant::now();
        let key = CacheKey::derive(url);
        let mut report = WriteReport::new(key.clone());

        let html = match strip_session_markup(html) {
            Ok(html) => html,
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "write",
                    result = "rewrite_error",
                    url = %url,
                    error = %err,
                    "Session markup could not be stripped; snapshot skipped"
                );
                return report;
            }
        };

        if let Err((failure, err)) = self.store.ensure_shard(&key) {
            warn!(
                target = TARGET,
                op = "write",
                result = failure.header_value(),
                url = %url,
                error = %err,
                "Snapshot directory unavailable"
            );
            report.dir_failure = Some(failure);
            counter!(METRIC_WRITE_TOTAL, "variant" => "all", "result" => "error").increment(1);
            return report;
        }

        for &variant in &self.variants {
            let outcome = encode(variant, html.as_bytes())
                .and_then(|payload| self.store.write_variant(&key, variant, &payload));
            match outcome {
                Ok(_) => {
                    report.written.push(variant);
                    counter!(METRIC_WRITE_TOTAL, "variant" => variant.as_str(), "result" => "ok")
                        .increment(1);
                }
                Err(err) => {
                    warn!(
                        target = TARGET,
                        op = "write",
                        result = "error",
                        variant = variant.as_str(),
                        key_prefix = key.diagnostic_prefix(),
                        error = %err,
                        "Snapshot variant write failed"
                    );
                    counter!(METRIC_WRITE_TOTAL, "variant" => variant.as_str(), "result" => "error")
                        .increment(1);
                    report.failed.push((variant, err.to_string()));
                }
            }
        }

        let elapsed = started_at.elapsed();
        histogram!(METRIC_WRITE_MS).record(elapsed.as_secs_f64() * 1000.0);
        info!(
            target = TARGET,
            op = "write",
            result = report.wrote_header(),
            url = %url,
            key_prefix = key.diagnostic_prefix(),
            variants = ?report.written,
            elapsed_ms = elapsed.as_millis() as u64,
            "Snapshot captured"
        );
        report
    }
}

/// Remove markup that must never be served to another visitor.
pub fn strip_session_markup(html: &str) -> Result<String, CacheError> {
    rewrite_str(
        html,
        RewriteStrSettings {
            // The admin toolbar only renders for signed-in users.
            element_content_handlers: vec![element!("div#wpadminbar", |el| {
                el.remove();
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|err| CacheError::Rewrite(err.to_string()))
}

/// Encode `html` for one variant.
pub fn encode(variant: Variant, html: &[u8]) -> Result<Vec<u8>, CacheError> {
    let encode_error = |source| CacheError::Encode {
        variant: variant.as_str(),
        source,
    };
    match variant {
        Variant::Raw => Ok(html.to_vec()),
        Variant::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
            encoder.write_all(html).map_err(encode_error)?;
            encoder.finish().map_err(encode_error)
        }
        Variant::Brotli => {
            let params = brotli::enc::BrotliEncoderParams {
                quality: BROTLI_QUALITY,
                lgwin: BROTLI_WINDOW,
                mode: brotli::enc::backward_references::BrotliEncoderMode::BROTLI_MODE_TEXT,
                ..Default::default()
            };
            let mut out = Vec::new();
            brotli::BrotliCompress(&mut Cursor::new(html), &mut out, &params)
                .map_err(encode_error)?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Read;

    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    use super::*;
    use crate::cache::keys::normalize_url;

    fn config(dir: &TempDir, variants: Vec<Variant>) -> CacheConfig {
        CacheConfig {
            base_directory: dir.path().to_path_buf(),
            variants,
            ..Default::default()
        }
    }

    #[test]
    fn strips_admin_toolbar() {
        let html = r#"<body><div id="wpadminbar"><div>nested</div>Howdy</div><p>keep</p></body>"#;
        let out = strip_session_markup(html).unwrap();
        assert_eq!(out, "<body><p>keep</p></body>");
    }

    #[test]
    fn writes_all_configured_variants() {
        let dir = TempDir::new().unwrap();
        let writer = SnapshotWriter::new(&config(
            &dir,
            vec![Variant::Raw, Variant::Gzip, Variant::Brotli],
        ));
        let url = normalize_url("https://example.com/about-us").unwrap();
        let html = "<html><body>about us</body></html>".repeat(50);

        let report = writer.write(&url, &html);
        assert_eq!(report.written.len(), 3);
        assert!(report.failed.is_empty());

        let raw = fs::read(report.key.snapshot_path(Variant::Raw, dir.path())).unwrap();
        assert_eq!(raw, html.as_bytes());

        let gz = fs::read(report.key.snapshot_path(Variant::Gzip, dir.path())).unwrap();
        let mut decoded = String::new();
        GzDecoder::new(gz.as_slice())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, html);

        let br = fs::read(report.key.snapshot_path(Variant::Brotli, dir.path())).unwrap();
        let mut decoded = Vec::new();
        brotli::BrotliDecompress(&mut Cursor::new(br), &mut decoded).unwrap();
        assert_eq!(decoded, html.as_bytes());
    }

    #[test]
    fn only_configured_variants_are_written() {
        let dir = TempDir::new().unwrap();
        let writer = SnapshotWriter::new(&config(&dir, vec![Variant::Gzip]));
        let url = normalize_url("https://example.com/").unwrap();
        let report = writer.write(&url, "<p>home</p>");
        assert_eq!(report.written, vec![Variant::Gzip]);
        assert!(!report.key.snapshot_path(Variant::Raw, dir.path()).exists());
        assert!(!report.key.snapshot_path(Variant::Brotli, dir.path()).exists());
    }

    #[test]
    fn unusable_base_reports_directory_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let writer = SnapshotWriter::new(&CacheConfig {
            base_directory: blocker,
            ..Default::default()
        });
        let report = writer.write(&normalize_url("https://example.com/").unwrap(), "<p></p>");
        assert!(!report.wrote_any());
        assert_eq!(report.wrote_header(), "no");
        assert_eq!(report.dir_failure, Some(DirFailure::Base));
    }
}
