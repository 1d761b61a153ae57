// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! In-process reference implementations of the backend traits: a thin, mutex-guarded wrapper
//! with async methods that never actually suspend, storing everything in memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use fnv::FnvHashMap as HashMap;
use parking_lot::Mutex;

use crate::{
    AddOutcome, DatasetSink, KvError, KvStore, QueueBackend, QueueHead, QueueRecord, RequestId,
    RequestUpdate,
};

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Bytes>,
}

/// An in-memory `KvStore`, suitable for single-process crawls and for tests.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        Ok(self.inner.lock().kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.inner.lock().kv.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.lock().kv.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .inner
            .lock()
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

struct QueueInner {
    next_id: u64,
    by_id: HashMap<RequestId, QueueRecord>,
    by_unique_key: HashMap<String, RequestId>,
    // Sorted by order_number; negative (forefront) entries naturally sort first.
    order: BTreeMap<i64, RequestId>,
    modified_at: SystemTime,
}

impl Default for QueueInner {
    fn default() -> Self {
        Self {
            next_id: 1,
            by_id: HashMap::default(),
            by_unique_key: HashMap::default(),
            order: BTreeMap::new(),
            modified_at: SystemTime::now(),
        }
    }
}

/// An in-memory `QueueBackend`. `request_queue` uses this directly for single-process crawls, and
/// as the reference oracle in its own property tests.
#[derive(Clone)]
pub struct MemoryQueueBackend {
    inner: Arc<Mutex<QueueInner>>,
}

impl Default for MemoryQueueBackend {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner::default())),
        }
    }
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(inner: &mut QueueInner) {
        inner.modified_at = SystemTime::now();
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn add_request(
        &self,
        unique_key: &str,
        order_number: i64,
        payload: Bytes,
    ) -> Result<AddOutcome, KvError> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_unique_key.get(unique_key) {
            let was_already_handled = inner.by_id.get(&id).map(|r| r.handled).unwrap_or(false);
            return Ok(AddOutcome {
                id,
                was_already_present: true,
                was_already_handled,
            });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.by_unique_key.insert(unique_key.to_string(), id);
        inner.order.insert(order_number, id);
        inner.by_id.insert(
            id,
            QueueRecord {
                id,
                unique_key: unique_key.to_string(),
                order_number,
                handled: false,
                lock_owner: None,
                lock_expires_at: None,
                payload,
            },
        );
        Self::touch(&mut inner);
        Ok(AddOutcome {
            id,
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn batch_add_requests(
        &self,
        batch: Vec<(String, i64, Bytes)>,
    ) -> Result<Vec<AddOutcome>, KvError> {
        let mut out = Vec::with_capacity(batch.len());
        for (unique_key, order_number, payload) in batch {
            out.push(self.add_request(&unique_key, order_number, payload).await?);
        }
        Ok(out)
    }

    async fn list_head(&self, limit: usize) -> Result<QueueHead, KvError> {
        let inner = self.inner.lock();
        let entries = inner
            .order
            .values()
            .filter_map(|id| inner.by_id.get(id))
            .take(limit)
            .cloned()
            .collect();
        Ok(QueueHead {
            entries,
            modified_at: inner.modified_at,
        })
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<QueueRecord>, KvError> {
        Ok(self.inner.lock().by_id.get(&id).cloned())
    }

    async fn update_request(&self, id: RequestId, fields: RequestUpdate) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        let record = inner
            .by_id
            .get_mut(&id)
            .ok_or(KvError::NotFound { id })?;
        if let Some(handled) = fields.handled {
            record.handled = handled;
        }
        if let Some(payload) = fields.payload {
            record.payload = payload;
        }
        Self::touch(&mut inner);
        Ok(())
    }

    async fn prolong_request_lock(
        &self,
        id: RequestId,
        token: &str,
        lock_secs: u64,
        reassign_order: Option<i64>,
    ) -> Result<SystemTime, KvError> {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();
        {
            let record = inner
                .by_id
                .get(&id)
                .ok_or(KvError::NotFound { id })?;
            let held = record.lock_owner.as_deref() == Some(token)
                && record.lock_expires_at.map(|exp| exp > now).unwrap_or(false);
            if !held {
                return Err(KvError::LockNotHeld { id });
            }
        }
        let new_expiry = now + std::time::Duration::from_secs(lock_secs);
        if let Some(order_number) = reassign_order {
            if let Some(record) = inner.by_id.get(&id) {
                inner.order.remove(&record.order_number);
            }
            inner.order.insert(order_number, id);
        }
        if let Some(record) = inner.by_id.get_mut(&id) {
            record.lock_expires_at = Some(new_expiry);
            if let Some(order_number) = reassign_order {
                record.order_number = order_number;
            }
        }
        Self::touch(&mut inner);
        Ok(new_expiry)
    }

    async fn delete_request_lock(
        &self,
        id: RequestId,
        token: &str,
        reassign_order: Option<i64>,
    ) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();
        {
            let record = inner
                .by_id
                .get(&id)
                .ok_or(KvError::NotFound { id })?;
            let held = record.lock_owner.as_deref() == Some(token)
                && record.lock_expires_at.map(|exp| exp > now).unwrap_or(false);
            if !held {
                return Err(KvError::LockNotHeld { id });
            }
        }
        if let Some(order_number) = reassign_order {
            if let Some(record) = inner.by_id.get(&id) {
                inner.order.remove(&record.order_number);
            }
            inner.order.insert(order_number, id);
        }
        if let Some(record) = inner.by_id.get_mut(&id) {
            record.lock_owner = None;
            record.lock_expires_at = None;
            if let Some(order_number) = reassign_order {
                record.order_number = order_number;
            }
        }
        Self::touch(&mut inner);
        Ok(())
    }

    async fn delete_request(&self, id: RequestId) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.by_id.remove(&id) {
            inner.order.remove(&record.order_number);
            inner.by_unique_key.remove(&record.unique_key);
        }
        Self::touch(&mut inner);
        Ok(())
    }

    async fn list_and_lock_head(
        &self,
        limit: usize,
        lock_secs: u64,
        token: &str,
    ) -> Result<Vec<QueueRecord>, KvError> {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();
        let expiry = now + std::time::Duration::from_secs(lock_secs);

        let candidate_ids: Vec<RequestId> = inner
            .order
            .values()
            .copied()
            .filter(|id| {
                let record = &inner.by_id[id];
                !record.handled
                    && record
                        .lock_expires_at
                        .map(|exp| exp <= now)
                        .unwrap_or(true)
            })
            .take(limit)
            .collect();

        let mut out = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            let record = inner.by_id.get_mut(&id).expect("id came from by_id");
            record.lock_owner = Some(token.to_string());
            record.lock_expires_at = Some(expiry);
            out.push(record.clone());
        }
        Self::touch(&mut inner);
        Ok(out)
    }
}

/// An in-memory append-only `DatasetSink`, primarily useful in tests.
#[derive(Clone, Default)]
pub struct MemoryDatasetSink {
    items: Arc<Mutex<Vec<Bytes>>>,
}

impl MemoryDatasetSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Bytes> {
        self.items.lock().clone()
    }
}

#[async_trait]
impl DatasetSink for MemoryDatasetSink {
    async fn push_data(&self, items: Vec<Bytes>) -> Result<(), KvError> {
        self.items.lock().extend(items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_on_unique_key() {
        let backend = MemoryQueueBackend::new();
        let a = backend
            .add_request("https://x/1", 1, Bytes::new())
            .await
            .unwrap();
        let b = backend
            .add_request("https://x/1", 2, Bytes::new())
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert!(!a.was_already_present);
        assert!(b.was_already_present);
    }

    #[tokio::test]
    async fn forefront_entries_sort_before_tail() {
        let backend = MemoryQueueBackend::new();
        backend.add_request("a", 1, Bytes::new()).await.unwrap();
        backend.add_request("b", 2, Bytes::new()).await.unwrap();
        backend.add_request("c", -1, Bytes::new()).await.unwrap();
        backend.add_request("d", -2, Bytes::new()).await.unwrap();

        let head = backend.list_head(10).await.unwrap();
        let keys: Vec<_> = head.entries.iter().map(|e| e.unique_key.clone()).collect();
        assert_eq!(keys, vec!["d", "c", "a", "b"]);
    }

    #[tokio::test]
    async fn lock_expiry_allows_relock() {
        let backend = MemoryQueueBackend::new();
        backend.add_request("a", 1, Bytes::new()).await.unwrap();
        let locked = backend.list_and_lock_head(10, 0, "w1").await.unwrap();
        assert_eq!(locked.len(), 1);

        // lock_secs = 0 means it is already expired; a second worker should be able to lock it.
        let relocked = backend.list_and_lock_head(10, 5, "w2").await.unwrap();
        assert_eq!(relocked.len(), 1);

        assert!(backend
            .prolong_request_lock(locked[0].id, "w1", 5, None)
            .await
            .is_err());
    }
}
