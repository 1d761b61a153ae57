// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The external boundaries the runtime drives but never implements itself: an HTTP client and an
//! optional headless-browser controller. Both are narrow traits with no default implementation —
//! wiring in a real client (an HTTP crate, a CDP driver) is the caller's job.

use std::time::Duration;

use async_trait::async_trait;
use fnv::FnvHashMap as HashMap;
use url::Url;

use crate::error::CrawlerError;

/// Lets the runtime record a status-code histogram without needing to know the concrete shape of
/// a navigation strategy's output. Implement for any `Output` type that has one; the default is
/// "no status code", which fits browser-page handles and other non-HTTP outputs.
pub trait StatusCodeHint {
    fn status_code_hint(&self) -> Option<u16> {
        None
    }
}

/// A single HTTP response, already past redirect-following.
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// The URL the response actually came from, after redirects.
    pub final_url: Url,
    pub body: bytes::Bytes,
}

impl StatusCodeHint for Response {
    fn status_code_hint(&self) -> Option<u16> {
        Some(self.status)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub proxy_url: Option<String>,
    pub timeout: Option<Duration>,
}

/// A pluggable HTTP transport. Implementations must not silently follow redirects without
/// reporting the final URL, must apply the caller's cookie jar to both the outgoing request and
/// the incoming response, and must respect cancellation of the enclosing task.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_request(
        &self,
        request: &crate::request::Request,
        cookie_jar: &mut cookie_store::CookieStore,
        options: SendOptions,
    ) -> Result<Response, CrawlerError>;
}

/// A headless-browser page handle, abstracted over whatever driver implements `BrowserController`.
pub struct Page {
    pub id: String,
}

/// A single `name=value` cookie bound to a domain/path, independent of any particular cookie
/// crate's representation, so a browser controller implementation can be written against whatever
/// CDP/WebDriver bindings it uses without this trait forcing a specific cookie type on it.
#[derive(Clone, Debug)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// The lifecycle surface of a browser-backed navigation strategy. Page and browser-process
/// lifecycle (graceful drain, hard-kill fallback) is owned by whatever implements this trait, not
/// by the crawl runtime.
#[async_trait]
pub trait BrowserController: Send + Sync + 'static {
    async fn new_page(&self) -> Result<Page, CrawlerError>;
    async fn close_page(&self, page: &Page) -> Result<(), CrawlerError>;
    async fn get_cookies(&self, page: &Page) -> Result<Vec<BrowserCookie>, CrawlerError>;
    async fn set_cookies(&self, page: &Page, cookies: Vec<BrowserCookie>) -> Result<(), CrawlerError>;
    /// Tears down the underlying browser process. Called once, at pool shutdown.
    async fn kill(&self) -> Result<(), CrawlerError>;
}
