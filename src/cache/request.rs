//! Framework-neutral view of an incoming request.
//!
//! Both the early-serve reader and the capture layer build the same
//! [`RequestFacts`] from the raw request head, so cache keys computed on either
//! side come from identical inputs.

use axum::http::{HeaderMap, Method, header, request::Parts};

use super::keys::{KeyError, NormalizedUrl, normalize_parts};

const FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Debug, Clone)]
pub struct RequestFacts {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub cookies: Vec<(String, String)>,
    pub accept_encoding: String,
    pub if_modified_since: Option<String>,
}

impl RequestFacts {
    /// Capture the facts from a request head.
    ///
    /// The scheme comes from `X-Forwarded-Proto` when a proxy terminates TLS,
    /// then from the URI, then from `default_scheme`.
    pub fn from_parts(parts: &Parts, default_scheme: &str) -> Self {
        let headers = &parts.headers;
        let scheme = header_str(headers, FORWARDED_PROTO)
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .or_else(|| parts.uri.scheme_str().map(str::to_ascii_lowercase))
            .unwrap_or_else(|| default_scheme.to_string());

        let host = header_str(headers, header::HOST.as_str())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            method: parts.method.clone(),
            scheme,
            host,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            cookies: parse_cookies(headers),
            accept_encoding: header_str(headers, header::ACCEPT_ENCODING.as_str())
                .unwrap_or_default()
                .to_string(),
            if_modified_since: header_str(headers, header::IF_MODIFIED_SINCE.as_str())
                .map(str::to_string),
        }
    }

    /// True for the safe read methods the cache can answer.
    pub fn is_safe_method(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// A present-but-empty `?` still counts as a query string.
    pub fn has_query(&self) -> bool {
        self.query.is_some()
    }

    /// Path plus query, as the reference `REQUEST_URI`.
    pub fn request_uri(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether any cookie name starts with one of `prefixes` (case-insensitive).
    pub fn has_cookie_with_prefix(&self, prefixes: &[String]) -> bool {
        self.cookies.iter().any(|(name, _)| {
            let name = name.to_ascii_lowercase();
            prefixes
                .iter()
                .any(|prefix| !prefix.is_empty() && name.starts_with(&prefix.to_ascii_lowercase()))
        })
    }

    pub fn accepts_encoding(&self, token: &str) -> bool {
        self.accept_encoding
            .split(',')
            .filter_map(|item| {
                let mut pieces = item.split(';');
                let coding = pieces.next()?.trim();
                let refused = pieces.any(|param| {
                    let param = param.trim().replace(' ', "");
                    param == "q=0" || param == "q=0.0" || param == "q=0.00" || param == "q=0.000"
                });
                (!refused).then_some(coding)
            })
            .any(|coding| coding.eq_ignore_ascii_case(token))
    }

    pub fn normalized_url(&self) -> Result<NormalizedUrl, KeyError> {
        normalize_parts(&self.scheme, &self.host, &self.path)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    fn facts(request: Request<()>) -> RequestFacts {
        let (parts, _) = request.into_parts();
        RequestFacts::from_parts(&parts, "http")
    }

    #[test]
    fn reads_host_path_and_query() {
        let facts = facts(
            Request::builder()
                .uri("/about-us?ref=nav")
                .header("Host", "Example.com")
                .body(())
                .unwrap(),
        );
        assert_eq!(facts.scheme, "http");
        assert_eq!(facts.host, "Example.com");
        assert_eq!(facts.path, "/about-us");
        assert_eq!(facts.query.as_deref(), Some("ref=nav"));
        assert_eq!(facts.request_uri(), "/about-us?ref=nav");
    }

    #[test]
    fn forwarded_proto_wins_over_default() {
        let facts = facts(
            Request::builder()
                .uri("/")
                .header("Host", "example.com")
                .header("X-Forwarded-Proto", "https, http")
                .body(())
                .unwrap(),
        );
        assert_eq!(facts.scheme, "https");
    }

    #[test]
    fn parses_cookie_pairs() {
        let facts = facts(
            Request::builder()
                .uri("/")
                .header("Cookie", "a=1; wordpress_logged_in_abc=x;flag")
                .body(())
                .unwrap(),
        );
        assert_eq!(facts.cookie("a"), Some("1"));
        assert_eq!(facts.cookie("flag"), Some(""));
        assert!(facts.has_cookie_with_prefix(&["WordPress_Logged_In_".to_string()]));
        assert!(!facts.has_cookie_with_prefix(&["session".to_string()]));
    }

    #[test]
    fn accept_encoding_respects_zero_quality() {
        let facts = facts(
            Request::builder()
                .uri("/")
                .header("Accept-Encoding", "gzip, deflate, br;q=0")
                .body(())
                .unwrap(),
        );
        assert!(facts.accepts_encoding("gzip"));
        assert!(!facts.accepts_encoding("br"));
    }
}
