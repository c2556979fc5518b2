//! Axum layers wiring the engine into a host router.
//!
//! [`early_serve_layer`] sits outermost and answers from disk when it can.
//! [`capture_layer`] sits inside it and stores what the host rendered.
//! Handlers tell the capture layer what they rendered by attaching a
//! [`ViewKind`] (and [`CriticalView`] for cart or account pages) as response
//! extensions.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::early::{EarlyOutcome, EarlyReader, EarlySettings, format_http_date};
use super::keys::Variant;
use super::policy::{CacheabilityPolicy, CriticalView, Decision, PolicyInput, ViewKind};
use super::request::RequestFacts;
use super::writer::{SnapshotWriter, WriteReport};

const TARGET: &str = "cache::middleware";

pub const HIT_CACHE_CONTROL: &str =
    "public, max-age=300, stale-while-revalidate=30, stale-if-error=86400";
pub const HIT_VARY: &str = "Accept-Encoding, Cookie";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

const REASON_HEADER_LIMIT: usize = 120;

const X_FS_EARLY: HeaderName = HeaderName::from_static("x-fs-early");
const X_FS_CACHE_KEY: HeaderName = HeaderName::from_static("x-fs-cache-key");
const X_FS_DIR: HeaderName = HeaderName::from_static("x-fs-dir");
const X_FS_EARLY_RESULT: HeaderName = HeaderName::from_static("x-fs-early-result");
const X_SNAPSHOT: HeaderName = HeaderName::from_static("x-snapshot");
const X_FS_CACHEABLE: HeaderName = HeaderName::from_static("x-fs-cacheable");
const X_FS_CACHE_PLUGIN: HeaderName = HeaderName::from_static("x-fs-cache-plugin");
const X_FS_REASON: HeaderName = HeaderName::from_static("x-fs-reason");
const X_FS_WROTE: HeaderName = HeaderName::from_static("x-fs-wrote");
const X_FS_ERROR: HeaderName = HeaderName::from_static("x-fs-error");

#[derive(Clone)]
pub struct EarlyServeState {
    pub reader: Arc<EarlyReader>,
    /// Scheme assumed when neither the URI nor a proxy header names one.
    pub default_scheme: String,
}

impl EarlyServeState {
    pub fn new(settings: EarlySettings, default_scheme: impl Into<String>) -> Self {
        Self {
            reader: Arc::new(EarlyReader::new(settings)),
            default_scheme: default_scheme.into(),
        }
    }
}

#[derive(Clone)]
pub struct CaptureState {
    pub policy: Arc<CacheabilityPolicy>,
    pub writer: Arc<SnapshotWriter>,
    pub debug_headers: bool,
    pub default_scheme: String,
}

impl CaptureState {
    pub fn new(config: &CacheConfig, default_scheme: impl Into<String>) -> Self {
        Self {
            policy: Arc::new(CacheabilityPolicy::new(config)),
            writer: Arc::new(SnapshotWriter::new(config)),
            debug_headers: config.debug_headers,
            default_scheme: default_scheme.into(),
        }
    }

    pub fn with_policy(mut self, policy: CacheabilityPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }
}

/// Wrap `router` so snapshots are served before it and captured after it.
pub fn install_layers<S>(
    router: Router<S>,
    early: EarlyServeState,
    capture: CaptureState,
) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(middleware::from_fn_with_state(capture, capture_layer))
        .layer(middleware::from_fn_with_state(early, early_serve_layer))
}

/// Answer from a stored snapshot or fall through to the host.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn early_serve_layer(
    State(state): State<EarlyServeState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let facts = RequestFacts::from_parts(&parts, &state.default_scheme);
    let head_only = parts.method == Method::HEAD;
    let debug_headers = state.reader.settings().debug_headers;

    let reader = Arc::clone(&state.reader);
    let outcome = match tokio::task::spawn_blocking(move || reader.lookup(&facts)).await {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(
                target = TARGET,
                op = "early_serve",
                result = "join_error",
                error = %err,
                "Early lookup task failed; falling through"
            );
            EarlyOutcome::Bypass
        }
    };

    let mut diagnostics = HeaderMap::new();
    if debug_headers {
        early_diagnostics(&outcome, &mut diagnostics);
    }

    let mut response = match outcome {
        EarlyOutcome::Hit {
            variant,
            body: snapshot,
            last_modified,
            ..
        } => {
            let length = snapshot.len();
            let mut response = if head_only {
                Response::new(Body::empty())
            } else {
                Response::new(Body::from(snapshot))
            };
            let headers = response.headers_mut();
            headers.insert(header::VARY, HeaderValue::from_static(HIT_VARY));
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(HIT_CACHE_CONTROL),
            );
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(HTML_CONTENT_TYPE),
            );
            if let Some(encoding) = variant.content_encoding() {
                headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
            }
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            set_header(headers, header::LAST_MODIFIED, &format_http_date(last_modified));
            let marker = match variant {
                Variant::Brotli => "FILE-BROTLI",
                _ => "FILE-GZIP",
            };
            headers.insert(X_SNAPSHOT, HeaderValue::from_static(marker));
            response
        }
        EarlyOutcome::NotModified { last_modified, .. } => {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            set_header(
                response.headers_mut(),
                header::LAST_MODIFIED,
                &format_http_date(last_modified),
            );
            response
        }
        EarlyOutcome::Miss { .. } | EarlyOutcome::Bypass => {
            next.run(Request::from_parts(parts, body)).await
        }
    };

    response.headers_mut().extend(diagnostics);
    response
}

fn early_diagnostics(outcome: &EarlyOutcome, headers: &mut HeaderMap) {
    let allowed = !matches!(outcome, EarlyOutcome::Bypass);
    headers.insert(
        X_FS_EARLY,
        HeaderValue::from_static(if allowed { "allowed" } else { "bypass" }),
    );
    if let Some(key) = outcome.key() {
        set_header(headers, X_FS_CACHE_KEY, key.diagnostic_prefix());
    }
    if let Some(dir) = outcome.dir() {
        set_header(headers, X_FS_DIR, &dir.display().to_string());
    }
    if let Some(result) = outcome.result_header() {
        headers.insert(X_FS_EARLY_RESULT, HeaderValue::from_static(result));
    }
}

/// Store cacheable HTML the host rendered. The response always passes
/// through unchanged apart from diagnostic headers.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn capture_layer(
    State(state): State<CaptureState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let facts = RequestFacts::from_parts(&parts, &state.default_scheme);
    let is_get = parts.method == Method::GET;

    let before = state.policy.evaluate(&PolicyInput::before_render(&facts));
    let mut diagnostics = HeaderMap::new();
    if state.debug_headers {
        decision_diagnostics(&before, &mut diagnostics);
    }

    let response = next.run(Request::from_parts(parts, body)).await;
    if !before.allowed {
        return with_headers(response, diagnostics);
    }

    let wrote = match capture(&state, &facts, is_get, response).await {
        (response, Ok(report)) => {
            if let Some(failure) = report.dir_failure {
                diagnostics.insert(X_FS_ERROR, HeaderValue::from_static(failure.header_value()));
            }
            diagnostics.insert(X_FS_WROTE, HeaderValue::from_static(report.wrote_header()));
            response
        }
        (response, Err(skip)) => {
            set_header(&mut diagnostics, X_FS_WROTE, &format!("no-{skip}"));
            response
        }
    };

    if state.debug_headers {
        with_headers(wrote, diagnostics)
    } else {
        wrote
    }
}

/// Re-check the policy with what rendering revealed, then write.
///
/// `Err` carries the reason the snapshot was skipped.
async fn capture(
    state: &CaptureState,
    facts: &RequestFacts,
    is_get: bool,
    response: Response,
) -> (Response, Result<WriteReport, String>) {
    if !is_get {
        return (response, Err("method".to_string()));
    }
    if response.status() != StatusCode::OK {
        return (response, Err("status".to_string()));
    }
    if !is_html(response.headers()) {
        return (response, Err("content-type".to_string()));
    }
    if response.headers().contains_key(header::CONTENT_ENCODING) {
        return (response, Err("encoded".to_string()));
    }

    let view = response
        .extensions()
        .get::<ViewKind>()
        .copied()
        .unwrap_or(ViewKind::Other);
    let critical = response.extensions().get::<CriticalView>().is_some();
    let session = state.policy.response_starts_session(response.headers());
    let after = state
        .policy
        .evaluate(&PolicyInput::after_render(facts, view, critical, session));
    if !after.allowed {
        return (response, Err(after.reason.to_string()));
    }

    let url = match facts.normalized_url() {
        Ok(url) => url,
        Err(err) => {
            debug!(target = TARGET, op = "capture", result = "bad_url", error = %err);
            return (response, Err("url".to_string()));
        }
    };

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(
                target = TARGET,
                op = "capture",
                result = "body_error",
                url = %url,
                error = %err,
                "Response body could not be collected"
            );
            // The body is gone; the host's status and headers still go out.
            parts.headers.remove(header::CONTENT_LENGTH);
            return (Response::from_parts(parts, Body::empty()), Err("body".to_string()));
        }
    };

    let html = match std::str::from_utf8(&bytes) {
        Ok(html) if !html.trim().is_empty() => html.to_owned(),
        Ok(_) => return (Response::from_parts(parts, Body::from(bytes)), Err("empty".to_string())),
        Err(_) => {
            return (
                Response::from_parts(parts, Body::from(bytes)),
                Err("encoding".to_string()),
            );
        }
    };

    let writer = Arc::clone(&state.writer);
    let report = tokio::task::spawn_blocking(move || writer.write(&url, &html)).await;
    let response = Response::from_parts(parts, Body::from(bytes));
    match report {
        Ok(report) => (response, Ok(report)),
        Err(err) => {
            warn!(
                target = TARGET,
                op = "capture",
                result = "join_error",
                error = %err,
                "Snapshot write task failed"
            );
            (response, Err("write".to_string()))
        }
    }
}

fn decision_diagnostics(decision: &Decision, headers: &mut HeaderMap) {
    headers.insert(
        X_FS_CACHEABLE,
        HeaderValue::from_static(if decision.allowed { "yes" } else { "no" }),
    );
    set_header(
        headers,
        X_FS_CACHE_PLUGIN,
        concat!("snapcache/", env!("CARGO_PKG_VERSION")),
    );
    if !decision.allowed {
        let reason: String = decision
            .reason
            .as_str()
            .chars()
            .take(REASON_HEADER_LIMIT)
            .collect();
        set_header(headers, X_FS_REASON, &reason);
    }
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim_start().to_ascii_lowercase().starts_with("text/html"))
}

fn with_headers(mut response: Response, headers: HeaderMap) -> Response {
    response.headers_mut().extend(headers);
    response
}

/// Values that are not valid header text are dropped.
fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
