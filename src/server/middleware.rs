//! Request pipeline middleware: artificial latency, query parsing, and
//! path canonicalization.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use rand::Rng;

/// Upper bound of the latency injected in slow debug mode.
pub const MAX_INJECTED_LATENCY_MS: u64 = 500;

/// Flat request parameters merged from the query string and form bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams(BTreeMap<String, String>);

impl RequestParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn extend_from_urlencoded(&mut self, input: &[u8]) {
        for (key, value) in url::form_urlencoded::parse(input) {
            self.0.insert(key.into_owned(), value.into_owned());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Delay every request by a random 0..=500 ms.
pub async fn inject_latency(request: Request, next: Next) -> Response {
    let delay = rand::thread_rng().gen_range(0..=MAX_INJECTED_LATENCY_MS);
    tokio::time::sleep(Duration::from_millis(delay)).await;
    next.run(request).await
}

pub async fn parse_query(mut request: Request, next: Next) -> Response {
    let mut params = RequestParams::default();
    if let Some(query) = request.uri().query() {
        params.extend_from_urlencoded(query.as_bytes());
    }
    request.extensions_mut().insert(params);
    next.run(request).await
}

/// Collapse repeated slashes, drop the trailing slash, and resolve `.`/`..`
/// segments.
pub fn canonical_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Permanently redirect non-canonical paths.
pub async fn sanitize_path(request: Request, next: Next) -> Response {
    let path = request.uri().path();
    let canonical = canonical_path(path);
    if canonical == path {
        return next.run(request).await;
    }

    let location = match request.uri().query() {
        Some(query) => format!("{canonical}?{query}"),
        None => canonical,
    };
    tracing::debug!(from = %path, to = %location, "Redirecting to canonical path");
    Redirect::permanent(&location).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_paths() {
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path("/status"), "/status");
        assert_eq!(canonical_path("//status"), "/status");
        assert_eq!(canonical_path("/abc/./app//x.js"), "/abc/app/x.js");
        assert_eq!(canonical_path("/abc/../../etc/passwd"), "/etc/passwd");
        assert_eq!(canonical_path("/abc/app/"), "/abc/app");
        assert_eq!(canonical_path("//"), "/");
    }

    #[test]
    fn params_merge_urlencoded() {
        let mut params = RequestParams::default();
        params.extend_from_urlencoded(b"name=facing+pass&depth=0.25");
        params.extend_from_urlencoded(b"depth=0.5");
        assert_eq!(params.get("name"), Some("facing pass"));
        assert_eq!(params.get("depth"), Some("0.5"));
        assert_eq!(params.get("missing"), None);
    }
}
