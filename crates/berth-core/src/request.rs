//! Per-request view of an Engine API call.
//!
//! [`IncomingRequest`] is the immutable snapshot the translator works on:
//! method, path, query pairs (ordered, repeats kept), headers, and the body
//! bytes collected exactly once. [`PathPattern`] is the segment glob used by
//! both the transport classifier and the runtime translator.

use axum::extract::Query;
use axum::http::{HeaderMap, Method, Uri, header};
use bytes::Bytes;

/// Immutable view of one inbound Engine API request.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    method: Method,
    path: String,
    raw_query: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
}

impl IncomingRequest {
    /// Build a request view from its parts and an already-collected body.
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> Self {
        let raw_query = uri.query().unwrap_or_default().to_string();
        Self {
            method,
            path: uri.path().to_string(),
            query: decode_query(&raw_query),
            raw_query,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The full request path, including any API version prefix.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// All values for a query key, in the order they appeared.
    pub fn query_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.query
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First value for a query key.
    pub fn query_value<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        self.query_values(key).next()
    }

    /// Whether the client asked for a protocol upgrade.
    pub fn wants_upgrade(&self) -> bool {
        wants_upgrade(&self.headers)
    }
}

/// Percent-decode a raw query string into ordered pairs, repeats kept.
///
/// An undecodable query yields no pairs.
pub fn decode_query(raw: &str) -> Vec<(String, String)> {
    if raw.is_empty() {
        return Vec::new();
    }
    let uri = match format!("/?{raw}").parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::debug!(query = raw, error = %e, "unparsable query string, ignoring");
            return Vec::new();
        }
    };
    match Query::<Vec<(String, String)>>::try_from_uri(&uri) {
        Ok(Query(pairs)) => pairs,
        Err(e) => {
            tracing::debug!(query = raw, error = %e, "undecodable query string, ignoring");
            Vec::new()
        }
    }
}

/// Whether a header map carries an `Upgrade` header.
pub fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
}

/// Strip an optional leading API version segment (`/v1.43/...`).
pub fn api_path(path: &str) -> &str {
    let Some(rest) = path.strip_prefix("/v") else {
        return path;
    };
    let (segment, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let versioned = segment
        .split_once('.')
        .is_some_and(|(major, minor)| is_digits(major) && is_digits(minor));
    if versioned { tail } else { path }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// A path glob over `/`-separated segments.
///
/// - a literal segment matches itself,
/// - `*` matches one or more non-empty segments (greedy, so image names like
///   `library/nginx` are captured whole),
/// - a trailing `**` matches any remainder, including nothing.
///
/// Patterns are matched against [`api_path`], so versioned and unversioned
/// requests behave the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathPattern(&'static str);

impl PathPattern {
    pub const fn new(pattern: &'static str) -> Self {
        Self(pattern)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// Whether `path` matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.captures(path).is_some()
    }

    /// Match `path` and return what each `*` captured, in order.
    pub fn captures(&self, path: &str) -> Option<Vec<String>> {
        let pattern = segments(self.0);
        let path = segments(api_path(path));
        let mut caps = Vec::new();
        walk(&pattern, &path, &mut caps).then_some(caps)
    }

    /// The first `*` capture, if the path matches.
    pub fn capture_first(&self, path: &str) -> Option<String> {
        self.captures(path).and_then(|caps| caps.into_iter().next())
    }
}

fn segments(path: &str) -> Vec<&str> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

fn walk(pattern: &[&str], path: &[&str], caps: &mut Vec<String>) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) if rest.is_empty() => true,
        Some((&"*", rest)) => {
            for take in (1..=path.len()).rev() {
                if path[..take].iter().any(|s| s.is_empty()) {
                    continue;
                }
                caps.push(path[..take].join("/"));
                if walk(rest, &path[take..], caps) {
                    return true;
                }
                caps.pop();
            }
            false
        }
        Some((literal, rest)) => {
            path.first() == Some(literal) && walk(rest, &path[1..], caps)
        }
    }
}
