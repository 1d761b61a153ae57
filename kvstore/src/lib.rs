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

//! Backend storage contract for the crawl engine.
//!
//! The engine itself never talks to a concrete database: every persistence-touching component
//! (`request_queue`, `request_list`, `session_pool`, `crawler_stats`) is generic over the traits
//! defined here. This crate also ships the two reference implementations conforming repos need:
//! an in-memory one suitable for single-process crawls and tests, and an optional `sled`-backed
//! one for durability across restarts.

mod error;
mod memory;
#[cfg(feature = "sled-backend")]
mod sled_backend;

pub use error::KvError;
pub use memory::{MemoryDatasetSink, MemoryKvStore, MemoryQueueBackend};
#[cfg(feature = "sled-backend")]
pub use sled_backend::{SledKvStore, SledQueueBackend};

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

/// Opaque id assigned to a queue entry on insertion.
pub type RequestId = u64;

///
/// A generic, schema-less key-value capability: get/set/delete of blobs, and listing by prefix.
/// Used for request-list checkpoints, session-pool snapshots, and statistics.
///
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError>;
    async fn set(&self, key: &str, value: Bytes) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

/// One persisted row of the request-queue backend.
#[derive(Clone, Debug)]
pub struct QueueRecord {
    pub id: RequestId,
    pub unique_key: String,
    pub order_number: i64,
    pub handled: bool,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<SystemTime>,
    /// Caller-opaque serialized `Request`. The backend never inspects this.
    pub payload: Bytes,
}

/// Patch applied by `update_request`; `None` fields are left unchanged.
#[derive(Clone, Debug, Default)]
pub struct RequestUpdate {
    pub handled: Option<bool>,
    pub payload: Option<Bytes>,
}

/// Outcome of inserting a single request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddOutcome {
    pub id: RequestId,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// A read of the queue head, tagged with the backend's notion of "last modified", used by
/// `request_queue`'s consistency-head check for deciding whether the queue is truly finished.
#[derive(Clone, Debug)]
pub struct QueueHead {
    pub entries: Vec<QueueRecord>,
    pub modified_at: SystemTime,
}

///
/// The operations a request-queue backend must provide. Implementations must be concurrency-safe
/// per entry: two callers racing on the same id must never both believe they hold its lock.
///
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// Inserts a request if its `unique_key` is not already present. `order_number` encodes
    /// forefront (negative) vs. tail (positive) placement; ties within a sign are insertion order.
    async fn add_request(
        &self,
        unique_key: &str,
        order_number: i64,
        payload: Bytes,
    ) -> Result<AddOutcome, KvError>;

    /// Chunked variant of `add_request`; each element is committed independently, so the batch as
    /// a whole is not atomic but each entry within it is.
    async fn batch_add_requests(
        &self,
        batch: Vec<(String, i64, Bytes)>,
    ) -> Result<Vec<AddOutcome>, KvError>;

    /// Reads up to `limit` of the lowest-order-number entries, whether locked or not.
    async fn list_head(&self, limit: usize) -> Result<QueueHead, KvError>;

    async fn get_request(&self, id: RequestId) -> Result<Option<QueueRecord>, KvError>;

    async fn update_request(&self, id: RequestId, fields: RequestUpdate) -> Result<(), KvError>;

    /// Extends an existing, caller-held lock. Fails unless `token` is the current holder and the
    /// lock has not yet expired. `reassign_order`, when set, atomically moves the entry to a new
    /// `order_number` in the same call. Order-number assignment is owned by `request_queue`, not
    /// by the backend, so callers pass the concrete number they computed rather than a bare
    /// forefront/tail flag.
    async fn prolong_request_lock(
        &self,
        id: RequestId,
        token: &str,
        lock_secs: u64,
        reassign_order: Option<i64>,
    ) -> Result<SystemTime, KvError>;

    /// Releases a lock without marking the entry handled, returning it to `Pending`. See
    /// `prolong_request_lock` for the `reassign_order` convention.
    async fn delete_request_lock(
        &self,
        id: RequestId,
        token: &str,
        reassign_order: Option<i64>,
    ) -> Result<(), KvError>;

    async fn delete_request(&self, id: RequestId) -> Result<(), KvError>;

    /// Atomically reads up to `limit` unlocked, unhandled entries in order and locks them for
    /// `lock_secs` under `token`, in one call.
    async fn list_and_lock_head(
        &self,
        limit: usize,
        lock_secs: u64,
        token: &str,
    ) -> Result<Vec<QueueRecord>, KvError>;
}

/// Append-only dataset sink for scraped results.
#[async_trait]
pub trait DatasetSink: Send + Sync + 'static {
    async fn push_data(&self, items: Vec<Bytes>) -> Result<(), KvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_store_round_trips() {
        let store = MemoryKvStore::new();
        store.set("k", Bytes::from_static(b"v")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
