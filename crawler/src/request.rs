// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The fetch descriptor and its deduplication identity.

use fnv::FnvHashMap as HashMap;
use kvstore::RequestId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

/// A fetch descriptor: the unit of work moving through the queue or list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub url: Url,
    pub method: String,
    pub payload: Option<bytes::Bytes>,
    pub headers: HashMap<String, String>,
    pub user_data: Value,
    pub retry_count: u32,
    pub error_messages: Vec<String>,
    pub no_retry: bool,
    pub label: Option<String>,
    pub unique_key: String,
    /// Assigned once the request is inserted into a queue; absent before that.
    pub id: Option<RequestId>,
}

impl Request {
    /// Builds a `GET` request, computing `unique_key` with the default derivation (normalized
    /// method + URL). Use `Request { unique_key: ..., ..Request::get(url) }` to override it.
    pub fn get(url: Url) -> Self {
        Self::new(url, "GET".to_string())
    }

    pub fn new(url: Url, method: String) -> Self {
        let unique_key = default_unique_key(&method, &url);
        Self {
            url,
            method,
            payload: None,
            headers: HashMap::default(),
            user_data: Value::Null,
            retry_count: 0,
            error_messages: Vec::new(),
            no_retry: false,
            label: None,
            unique_key,
            id: None,
        }
    }
}

/// Normalizes a URL the same way the default `unique_key` derivation does, independent of method:
/// lowercases the scheme and host, drops a default port, and strips a trailing `/` on an empty
/// path, so that equivalent URLs collapse to one key.
fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    let _ = normalized.set_scheme(&url.scheme().to_lowercase());
    if let Some(host) = url.host_str() {
        let _ = normalized.set_host(Some(&host.to_lowercase()));
    }
    let mut s = normalized.to_string();
    if s.ends_with('/') && url.path() == "/" && url.query().is_none() {
        s.pop();
    }
    s
}

fn default_unique_key(method: &str, url: &Url) -> String {
    format!("{}:{}", method.to_uppercase(), normalize_url(url))
}

/// Computes the deduplication identity of a `Request`. The default derivation is
/// `DefaultUniqueKeyFn`; callers with bespoke normalization needs (session-scoped keys,
/// fragment-sensitive APIs) can implement their own.
pub trait UniqueKeyFn: Send + Sync + 'static {
    fn unique_key(&self, request: &Request) -> String;
}

#[derive(Default)]
pub struct DefaultUniqueKeyFn;

impl UniqueKeyFn for DefaultUniqueKeyFn {
    fn unique_key(&self, request: &Request) -> String {
        default_unique_key(&request.method, &request.url)
    }
}

/// A `UniqueKeyFn` that folds the request body into the key via a SHA-256 digest, for APIs where
/// two POSTs to the same URL with different payloads are genuinely different work items.
pub struct PayloadSensitiveUniqueKeyFn;

impl UniqueKeyFn for PayloadSensitiveUniqueKeyFn {
    fn unique_key(&self, request: &Request) -> String {
        let mut hasher = Sha256::new();
        hasher.update(default_unique_key(&request.method, &request.url).as_bytes());
        if let Some(payload) = &request.payload {
            hasher.update(payload);
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_urls_share_a_unique_key() {
        let a = Request::get(Url::parse("https://Example.com/").unwrap());
        let b = Request::get(Url::parse("https://example.com").unwrap());
        assert_eq!(a.unique_key, b.unique_key);
    }

    #[test]
    fn different_methods_do_not_share_a_unique_key() {
        let get = Request::get(Url::parse("https://example.com/x").unwrap());
        let post = Request::new(Url::parse("https://example.com/x").unwrap(), "POST".to_string());
        assert_ne!(get.unique_key, post.unique_key);
    }

    #[test]
    fn payload_sensitive_key_distinguishes_bodies() {
        let key_fn = PayloadSensitiveUniqueKeyFn;
        let mut a = Request::new(Url::parse("https://example.com/x").unwrap(), "POST".to_string());
        a.payload = Some(bytes::Bytes::from_static(b"one"));
        let mut b = a.clone();
        b.payload = Some(bytes::Bytes::from_static(b"two"));
        assert_ne!(key_fn.unique_key(&a), key_fn.unique_key(&b));
    }
}
