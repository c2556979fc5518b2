//! Cacheability decisions.
//!
//! The policy is evaluated twice per request: once from the request head before
//! the handler runs, and again after the response exists, because rendering may
//! have started a session or revealed the kind of view.

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, header};

use super::config::{CacheConfig, DEFAULT_NO_CACHE_PATHS};
use super::request::RequestFacts;

/// Path segments that always belong to a transaction in progress.
pub const CRITICAL_SEGMENTS: [&str; 5] = [
    "cart",
    "checkout",
    "my-account",
    "order-pay",
    "order-received",
];

pub const CART_ITEMS_COOKIE: &str = "woocommerce_items_in_cart";
pub const CART_HASH_COOKIE: &str = "woocommerce_cart_hash";

/// The kind of page the host rendered.
///
/// Handlers attach it to the response as an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Singular,
    FrontPage,
    Home,
    Archive,
    Search,
    NotFound,
    Feed,
    Other,
}

impl ViewKind {
    pub fn is_whitelisted(self) -> bool {
        matches!(
            self,
            ViewKind::Singular | ViewKind::FrontPage | ViewKind::Home | ViewKind::Archive
        )
    }
}

/// Marker a handler attaches when it rendered a cart, checkout or account view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalView;

/// Machine-readable reason attached to every decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasonCode {
    Ok,
    Filtered,
    Custom(String),
    LoggedIn,
    Method,
    QueryString,
    SearchOrNotFound,
    WcCritical,
    CartItems,
    CartHash,
    AddToCart,
    WcAjax,
    FormPage,
    ViewNotWhitelisted,
    Feed,
}

impl ReasonCode {
    pub fn as_str(&self) -> &str {
        match self {
            ReasonCode::Ok => "ok",
            ReasonCode::Filtered => "filtered",
            ReasonCode::Custom(code) => code,
            ReasonCode::LoggedIn => "logged-in",
            ReasonCode::Method => "method",
            ReasonCode::QueryString => "query-string",
            ReasonCode::SearchOrNotFound => "search/404",
            ReasonCode::WcCritical => "wc-critical",
            ReasonCode::CartItems => "cart-items",
            ReasonCode::CartHash => "cart-hash",
            ReasonCode::AddToCart => "add-to-cart",
            ReasonCode::WcAjax => "wc-ajax",
            ReasonCode::FormPage => "form-page",
            ReasonCode::ViewNotWhitelisted => "view-not-whitelisted",
            ReasonCode::Feed => "feed",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: ReasonCode,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: ReasonCode::Ok,
        }
    }

    pub fn deny(reason: ReasonCode) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Everything the policy looks at.
///
/// `view` is `None` before the handler has run; the view rule is skipped then.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub request: &'a RequestFacts,
    pub authenticated: bool,
    pub critical_view: bool,
    pub view: Option<ViewKind>,
}

impl<'a> PolicyInput<'a> {
    pub fn before_render(request: &'a RequestFacts) -> Self {
        Self {
            request,
            authenticated: false,
            critical_view: false,
            view: None,
        }
    }

    pub fn after_render(
        request: &'a RequestFacts,
        view: ViewKind,
        critical_view: bool,
        authenticated: bool,
    ) -> Self {
        Self {
            request,
            authenticated,
            critical_view,
            view: Some(view),
        }
    }
}

/// Extension point for hosts that need to bend the rules.
pub trait PolicyOverride: Send + Sync {
    /// Decide outright, skipping every built-in rule.
    fn pre_check(&self, _input: &PolicyInput<'_>) -> Option<Decision> {
        None
    }

    /// Adjust the view whitelist result.
    fn post_check(&self, _input: &PolicyInput<'_>, allowed: bool) -> bool {
        allowed
    }
}

#[derive(Clone)]
pub struct CacheabilityPolicy {
    no_cache_paths: Vec<String>,
    session_cookie_prefixes: Vec<String>,
    hook: Option<Arc<dyn PolicyOverride>>,
}

impl fmt::Debug for CacheabilityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheabilityPolicy")
            .field("no_cache_paths", &self.no_cache_paths)
            .field("session_cookie_prefixes", &self.session_cookie_prefixes)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl CacheabilityPolicy {
    pub fn new(config: &CacheConfig) -> Self {
        let mut no_cache_paths: Vec<String> = Vec::new();
        let paths = DEFAULT_NO_CACHE_PATHS
            .iter()
            .copied()
            .chain(config.no_cache_path_substrings.iter().map(String::as_str));
        for path in paths {
            let path = path.trim().to_ascii_lowercase();
            if !path.is_empty() && !no_cache_paths.contains(&path) {
                no_cache_paths.push(path);
            }
        }
        Self {
            no_cache_paths,
            session_cookie_prefixes: config.session_cookie_prefixes.clone(),
            hook: None,
        }
    }

    pub fn with_override(mut self, hook: Arc<dyn PolicyOverride>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Evaluate the rules in priority order; the first deny wins.
    pub fn evaluate(&self, input: &PolicyInput<'_>) -> Decision {
        if let Some(hook) = &self.hook
            && let Some(decision) = hook.pre_check(input)
        {
            return decision;
        }

        let request = input.request;

        if !request.is_safe_method() {
            return Decision::deny(ReasonCode::Method);
        }
        if input.authenticated || request.has_cookie_with_prefix(&self.session_cookie_prefixes) {
            return Decision::deny(ReasonCode::LoggedIn);
        }
        if request.has_query() {
            return Decision::deny(ReasonCode::QueryString);
        }
        if let Some(reason) = transactional_reason(request, input.critical_view) {
            return Decision::deny(reason);
        }

        let uri = request.request_uri().to_ascii_lowercase();
        if self.no_cache_paths.iter().any(|path| uri.contains(path)) {
            return Decision::deny(ReasonCode::FormPage);
        }

        let Some(view) = input.view else {
            return Decision::allow();
        };
        match view {
            ViewKind::Search | ViewKind::NotFound => {
                return Decision::deny(ReasonCode::SearchOrNotFound);
            }
            ViewKind::Feed => return Decision::deny(ReasonCode::Feed),
            _ => {}
        }

        let mut allowed = view.is_whitelisted();
        if let Some(hook) = &self.hook {
            allowed = hook.post_check(input, allowed);
        }
        if allowed {
            Decision::allow()
        } else {
            Decision::deny(ReasonCode::ViewNotWhitelisted)
        }
    }

    /// Whether a `Set-Cookie` in the response opens a session.
    pub fn response_starts_session(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split('=').next())
            .map(|name| name.trim().to_ascii_lowercase())
            .any(|name| {
                self.session_cookie_prefixes
                    .iter()
                    .any(|prefix| !prefix.is_empty() && name.starts_with(&prefix.to_ascii_lowercase()))
            })
    }
}

/// True when a path segment names a checkout-flow endpoint.
pub fn is_critical_path(path: &str) -> bool {
    path.split('/').any(|segment| {
        CRITICAL_SEGMENTS
            .iter()
            .any(|critical| segment.eq_ignore_ascii_case(critical))
    })
}

fn transactional_reason(request: &RequestFacts, critical_view: bool) -> Option<ReasonCode> {
    if critical_view || is_critical_path(&request.path) {
        return Some(ReasonCode::WcCritical);
    }
    if request.cookie(CART_ITEMS_COOKIE).is_some_and(|v| !v.is_empty()) {
        return Some(ReasonCode::CartItems);
    }
    if request.cookie(CART_HASH_COOKIE).is_some_and(|v| !v.is_empty()) {
        return Some(ReasonCode::CartHash);
    }
    let uri = request.request_uri().to_ascii_lowercase();
    if uri.contains("add-to-cart=") {
        return Some(ReasonCode::AddToCart);
    }
    if uri.contains("/wc-ajax/") {
        return Some(ReasonCode::WcAjax);
    }
    None
}
