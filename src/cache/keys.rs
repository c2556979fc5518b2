//! Cache key derivation and shard layout.
//!
//! This module is the single source of truth for turning a request URL into a
//! snapshot location. The early-serve reader and the capture writer both call
//! into it, so the two execution paths cannot drift apart. It reads no runtime
//! state: only the base directory is supplied by the caller.
//!
//! Changing [`normalize_parts`] or the digest silently orphans every snapshot on
//! disk, so any such change must bump [`KEY_ALGORITHM_VERSION`]. The version is
//! written into the early-serve manifest and checked before serving.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

/// Version of the normalization + digest pair.
pub const KEY_ALGORITHM_VERSION: u32 = 2;

/// Number of hex characters of the key surfaced in diagnostic headers.
pub const KEY_DIAGNOSTIC_PREFIX: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("url `{url}` could not be parsed: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("url `{0}` has no host")]
    MissingHost(String),
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
}

/// A URL reduced to the form that is hashed.
///
/// `scheme://host[:port]/path/` with a lower-case host, no query, no fragment,
/// no repeated separators and exactly one trailing separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedUrl(String);

impl NormalizedUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize the three request components seen by a server.
///
/// `host` may carry a port; default ports for the scheme are dropped so that
/// `Host: example.com:443` and `https://example.com/` agree.
pub fn normalize_parts(scheme: &str, host: &str, path: &str) -> Result<NormalizedUrl, KeyError> {
    let scheme = scheme.trim().to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" => "80",
        "https" => "443",
        other => return Err(KeyError::UnsupportedScheme(other.to_string())),
    };

    let mut host = host.trim().to_ascii_lowercase();
    let default_suffix = format!(":{default_port}");
    if host.ends_with(&default_suffix) {
        host.truncate(host.len() - default_suffix.len());
    }
    if host.is_empty() {
        return Err(KeyError::MissingHost(path.to_string()));
    }

    Ok(NormalizedUrl(format!(
        "{scheme}://{host}{}",
        normalize_path(path)
    )))
}

/// Normalize an absolute URL string (canonical URLs from the content store,
/// operator input, warm targets).
///
/// The URL is parsed for its scheme and authority only. The path is taken as
/// written and goes through [`normalize_path`], exactly like a request path.
pub fn normalize_url(raw: &str) -> Result<NormalizedUrl, KeyError> {
    let raw = raw.trim();
    let parsed = Url::parse(raw).map_err(|err| KeyError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| KeyError::MissingHost(raw.to_string()))?;
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let path = raw_path(raw).unwrap_or_else(|| parsed.path());
    normalize_parts(parsed.scheme(), &authority, path)
}

/// Path text of an absolute URL as written, before any re-serialization.
fn raw_path(raw: &str) -> Option<&str> {
    let (_, rest) = raw.split_once("://")?;
    let start = rest.find(['/', '\\', '?', '#']).unwrap_or(rest.len());
    Some(&rest[start..])
}

/// Canonical path form shared by every caller.
///
/// Query and fragment are dropped, duplicate `/` collapsed, `.` and `..`
/// segments resolved and reserved characters percent-encoded the way
/// [`Url`] serializes them, then exactly one trailing `/` is kept.
pub fn normalize_path(path: &str) -> String {
    let path = path
        .split(['?', '#'])
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    let collapsed = collapse_separators(path);
    let resolved = match Url::parse("http://localhost/") {
        Ok(mut url) => {
            url.set_path(&collapsed);
            url.path().to_string()
        }
        Err(_) => collapsed,
    };

    let mut out = collapse_separators(&resolved);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

fn collapse_separators(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    if !path.starts_with('/') {
        out.push('/');
    }
    for ch in path.chars() {
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Append a trailing separator unless one is already present.
pub fn trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

/// Hex digest identifying one snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a normalized URL.
    pub fn derive(url: &NormalizedUrl) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_str().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn diagnostic_prefix(&self) -> &str {
        &self.0[..KEY_DIAGNOSTIC_PREFIX]
    }

    /// Two-level shard directory `base/aa/bb`.
    pub fn shard_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.0[0..2]).join(&self.0[2..4])
    }

    /// Location of one variant of this entry.
    pub fn snapshot_path(&self, variant: Variant, base: &Path) -> PathBuf {
        self.shard_dir(base)
            .join(format!("{}.{}", self.0, variant.extension()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One encoding of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[serde(alias = "html")]
    Raw,
    #[serde(alias = "gz")]
    Gzip,
    #[serde(alias = "br")]
    Brotli,
}

impl Variant {
    pub const ALL: [Variant; 3] = [Variant::Raw, Variant::Gzip, Variant::Brotli];

    /// Order the early reader tries pre-compressed variants in.
    pub const SERVE_PRIORITY: [Variant; 2] = [Variant::Brotli, Variant::Gzip];

    pub fn extension(self) -> &'static str {
        match self {
            Variant::Raw => "html",
            Variant::Gzip => "gz",
            Variant::Brotli => "br",
        }
    }

    /// Token used in `Accept-Encoding` / `Content-Encoding`.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Variant::Raw => None,
            Variant::Gzip => Some("gzip"),
            Variant::Brotli => Some("br"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Variant::Raw => "raw",
            Variant::Gzip => "gzip",
            Variant::Brotli => "brotli",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" | "html" => Ok(Variant::Raw),
            "gzip" | "gz" => Ok(Variant::Gzip),
            "brotli" | "br" => Ok(Variant::Brotli),
            other => Err(format!("unknown variant `{other}`")),
        }
    }
}
