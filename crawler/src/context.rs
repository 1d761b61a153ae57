// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The handle passed to hooks and request handlers.
//!
//! The runtime, the queue, and the handler naturally form a cycle: the handler enqueues more
//! requests back into the same queue it was fed from. Breaking the cycle with a reverse pointer
//! from the context back to the runtime would make the context's lifetime hostage to the
//! runtime's; instead the context owns narrow, independent handles to just the collaborators a
//! handler is allowed to touch.

use std::sync::Arc;

use bytes::Bytes;
use kvstore::{DatasetSink, KvError, QueueBackend};
use parking_lot::Mutex;
use request_queue::RequestQueue;
use serde_json::Value;
use session_pool::Session;

use crate::request::{Request, UniqueKeyFn};

/// Handed to hooks and request handlers. Exposes only what a handler needs to drive the crawl
/// forward: queue more work, push scraped results, and read its bound session. `R` is whatever a
/// navigation strategy produces (an HTTP response, a browser page handle); it starts absent and is
/// filled in once navigation completes, so pre-navigation hooks see a context with no response yet
/// while the handler always sees one.
pub struct CrawlingContext<B, S, R = ()> {
    queue: Arc<RequestQueue<B>>,
    sink: Arc<S>,
    unique_key_fn: Arc<dyn UniqueKeyFn>,
    request: Request,
    session: Option<Arc<Session>>,
    response: Mutex<Option<R>>,
}

impl<B: QueueBackend, S: DatasetSink, R> CrawlingContext<B, S, R> {
    pub fn new(
        queue: Arc<RequestQueue<B>>,
        sink: Arc<S>,
        unique_key_fn: Arc<dyn UniqueKeyFn>,
        request: Request,
        session: Option<Arc<Session>>,
    ) -> Self {
        Self {
            queue,
            sink,
            unique_key_fn,
            request,
            session,
            response: Mutex::new(None),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Called by the runtime once navigation completes, before post-navigation hooks run.
    pub fn set_response(&self, response: R) {
        *self.response.lock() = Some(response);
    }

    /// Takes the navigation output, leaving `None` behind. The handler is expected to call this
    /// at most once; subsequent calls see `None`.
    pub fn take_response(&self) -> Option<R> {
        self.response.lock().take()
    }

    /// Queues discovered links as new tail requests, deduplicating against the existing queue
    /// contents the same way the initial seed insertion does.
    pub async fn enqueue_links(&self, requests: Vec<Request>) -> Result<(), KvError> {
        self.add_requests(requests, false).await
    }

    /// Queues requests, optionally at the forefront (served ahead of existing tail entries).
    pub async fn add_requests(&self, requests: Vec<Request>, forefront: bool) -> Result<(), KvError> {
        if requests.is_empty() {
            return Ok(());
        }
        let batch = requests
            .into_iter()
            .map(|req| {
                let unique_key = self.unique_key_fn.unique_key(&req);
                let payload = serde_json::to_vec(&req).unwrap_or_default();
                (unique_key, Bytes::from(payload), forefront)
            })
            .collect();
        self.queue.add_batch(batch).await?;
        Ok(())
    }

    /// Appends scraped records to the dataset sink.
    pub async fn push_data(&self, items: Vec<Value>) -> Result<(), KvError> {
        let encoded: Vec<Bytes> = items
            .into_iter()
            .map(|v| Bytes::from(serde_json::to_vec(&v).unwrap_or_default()))
            .collect();
        self.sink.push_data(encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::{MemoryDatasetSink, MemoryQueueBackend};
    use request_queue::RequestQueue;
    use url::Url;

    use crate::request::DefaultUniqueKeyFn;

    fn context() -> CrawlingContext<MemoryQueueBackend, MemoryDatasetSink> {
        CrawlingContext::new(
            Arc::new(RequestQueue::new(MemoryQueueBackend::new())),
            Arc::new(MemoryDatasetSink::new()),
            Arc::new(DefaultUniqueKeyFn),
            Request::get(Url::parse("https://example.com/").unwrap()),
            None,
        )
    }

    #[tokio::test]
    async fn enqueue_links_adds_to_the_shared_queue() {
        let ctx = context();
        ctx.enqueue_links(vec![Request::get(Url::parse("https://example.com/a").unwrap())])
            .await
            .unwrap();
        let fetched = ctx.queue.fetch_next(10).await.unwrap();
        assert_eq!(fetched.len(), 1);
    }

    #[tokio::test]
    async fn push_data_forwards_to_the_sink() {
        let ctx = context();
        ctx.push_data(vec![serde_json::json!({"k": "v"})]).await.unwrap();
    }
}
