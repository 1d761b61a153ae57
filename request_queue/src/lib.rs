// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! A durable request queue, generic over any `kvstore::QueueBackend`.
//!
//! Order-number assignment lives here rather than in the backend: forefront insertions get a
//! strictly decreasing negative number, tail insertions a strictly increasing positive one, so a
//! plain ascending scan of order numbers yields forefront-before-tail, insertion-ordered-within-
//! sign fetch order. Transient backend errors are retried with an exponential backoff, the same
//! shape used around storage calls elsewhere in this workspace.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use backoff::ExponentialBackoff;
use bytes::Bytes;
use kvstore::{AddOutcome, KvError, QueueBackend, QueueRecord, RequestId};

/// How long a fetched lock is held before it is considered abandoned, absent a prolong call.
const DEFAULT_LOCK_SECS: u64 = 5 * 60;
/// How long `is_finished` waits between its two consistency-head reads.
const CONSISTENCY_HEAD_DELAY: Duration = Duration::from_millis(500);

pub struct RequestQueue<B> {
    backend: B,
    forefront_counter: AtomicI64,
    tail_counter: AtomicI64,
    lock_secs: u64,
    client_token: String,
    retry_backoff: ExponentialBackoff,
}

impl<B: QueueBackend> RequestQueue<B> {
    pub fn new(backend: B) -> Self {
        Self::with_lock_secs(backend, DEFAULT_LOCK_SECS)
    }

    pub fn with_lock_secs(backend: B, lock_secs: u64) -> Self {
        Self {
            backend,
            forefront_counter: AtomicI64::new(-1),
            tail_counter: AtomicI64::new(1),
            lock_secs,
            client_token: uuid::Uuid::new_v4().to_string(),
            retry_backoff: ExponentialBackoff::default(),
        }
    }

    fn next_order_number(&self, forefront: bool) -> i64 {
        if forefront {
            self.forefront_counter.fetch_sub(1, Ordering::Relaxed)
        } else {
            self.tail_counter.fetch_add(1, Ordering::Relaxed)
        }
    }

    async fn retrying<T, F, Fut>(&self, mut f: F) -> Result<T, KvError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, KvError>>,
    {
        backoff::future::retry(self.retry_backoff.clone(), || async {
            f().await.map_err(|e| {
                if e.is_transient() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }

    pub async fn add(
        &self,
        unique_key: &str,
        payload: Bytes,
        forefront: bool,
    ) -> Result<AddOutcome, KvError> {
        let order_number = self.next_order_number(forefront);
        self.retrying(|| self.backend.add_request(unique_key, order_number, payload.clone()))
            .await
    }

    pub async fn add_batch(
        &self,
        items: Vec<(String, Bytes, bool)>,
    ) -> Result<Vec<AddOutcome>, KvError> {
        let batch: Vec<(String, i64, Bytes)> = items
            .into_iter()
            .map(|(key, payload, forefront)| (key, self.next_order_number(forefront), payload))
            .collect();
        self.retrying(|| self.backend.batch_add_requests(batch.clone()))
            .await
    }

    /// Fetches and locks up to `limit` requests for this queue's client token.
    pub async fn fetch_next(&self, limit: usize) -> Result<Vec<QueueRecord>, KvError> {
        self.retrying(|| {
            self.backend
                .list_and_lock_head(limit, self.lock_secs, &self.client_token)
        })
        .await
    }

    /// Marks a request done. Implemented as a delete rather than an `update_request(handled)`:
    /// once a request is handled it should never again be a candidate for `list_head` or
    /// `list_and_lock_head`, and a fully removed entry guarantees that with no backend-specific
    /// filtering logic required.
    pub async fn mark_handled(&self, id: RequestId) -> Result<(), KvError> {
        self.retrying(|| self.backend.delete_request(id)).await
    }

    /// Releases a held lock, optionally pushing the request back to the forefront so it is
    /// retried before fresh tail entries (used on transient handler failures).
    pub async fn reclaim(&self, id: RequestId, forefront: bool) -> Result<(), KvError> {
        let reassign_order = Some(self.next_order_number(forefront));
        self.retrying(|| {
            self.backend
                .delete_request_lock(id, &self.client_token, reassign_order)
        })
        .await
    }

    pub async fn prolong_lock(&self, id: RequestId) -> Result<SystemTime, KvError> {
        self.retrying(|| {
            self.backend
                .prolong_request_lock(id, &self.client_token, self.lock_secs, None)
        })
        .await
    }

    pub async fn delete(&self, id: RequestId) -> Result<(), KvError> {
        self.retrying(|| self.backend.delete_request(id)).await
    }

    /// True if the next head read returns nothing right now. Unlike `is_finished`, a single empty
    /// read is enough: this is used for quick, non-authoritative checks (e.g. deciding whether to
    /// poll again before spinning up more workers).
    pub async fn is_empty(&self) -> Result<bool, KvError> {
        Ok(self.retrying(|| self.backend.list_head(1)).await?.entries.is_empty())
    }

    /// True only once two head reads, separated by a short delay, both come back empty with no
    /// change in the backend's "last modified" marker in between. A single empty read can't rule
    /// out a concurrent writer that has reserved a slot but not yet committed it; requiring an
    /// unchanged, still-empty second read does.
    pub async fn is_finished(&self) -> Result<bool, KvError> {
        let first = self.retrying(|| self.backend.list_head(1)).await?;
        if !first.entries.is_empty() {
            return Ok(false);
        }
        tokio::time::sleep(CONSISTENCY_HEAD_DELAY).await;
        let second = self.retrying(|| self.backend.list_head(1)).await?;
        Ok(second.entries.is_empty() && second.modified_at == first.modified_at)
    }
}

impl<B: QueueBackend> RequestQueue<B> {
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryQueueBackend;

    fn queue() -> RequestQueue<MemoryQueueBackend> {
        RequestQueue::with_lock_secs(MemoryQueueBackend::new(), 60)
    }

    #[tokio::test]
    async fn forefront_requests_are_fetched_before_tail() {
        let q = queue();
        q.add("a", Bytes::new(), false).await.unwrap();
        q.add("b", Bytes::new(), true).await.unwrap();

        let fetched = q.fetch_next(10).await.unwrap();
        let keys: Vec<_> = fetched.iter().map(|r| r.unique_key.clone()).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn reclaim_to_forefront_overtakes_later_tail_adds() {
        let q = queue();
        let fetched_a = q.add("a", Bytes::new(), false).await.unwrap();
        q.fetch_next(10).await.unwrap();
        q.reclaim(fetched_a.id, true).await.unwrap();
        q.add("c", Bytes::new(), false).await.unwrap();

        let fetched = q.fetch_next(10).await.unwrap();
        let keys: Vec<_> = fetched.iter().map(|r| r.unique_key.clone()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn empty_queue_reports_finished() {
        let q = queue();
        assert!(q.is_empty().await.unwrap());
        assert!(q.is_finished().await.unwrap());
    }

    #[tokio::test]
    async fn locked_but_unhandled_request_keeps_queue_non_empty() {
        let q = queue();
        q.add("a", Bytes::new(), false).await.unwrap();
        q.fetch_next(10).await.unwrap();
        // The entry is locked, not handled: list_head still reports it, so the queue is not empty.
        assert!(!q.is_empty().await.unwrap());
        assert!(!q.is_finished().await.unwrap());
    }

    #[tokio::test]
    async fn mark_handled_empties_the_queue() {
        let q = queue();
        let outcome = q.add("a", Bytes::new(), false).await.unwrap();
        q.fetch_next(10).await.unwrap();
        q.mark_handled(outcome.id).await.unwrap();
        assert!(q.is_empty().await.unwrap());
        assert!(q.is_finished().await.unwrap());
    }
}
