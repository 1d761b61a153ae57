// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A durable backend built on `sled`, an embedded, ACID, pure-Rust key-value store that needs
//! nothing but a directory on disk. Gives request-list checkpoints and session-pool snapshots a
//! real crash-consistent home across restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sled::{Db, Tree};

use crate::{
    AddOutcome, KvError, KvStore, QueueBackend, QueueHead, QueueRecord, RequestId, RequestUpdate,
};

fn to_backend_err(e: sled::Error) -> KvError {
    KvError::Backend(e.to_string())
}

/// A `KvStore` backed by a single `sled` tree.
#[derive(Clone)]
pub struct SledKvStore {
    tree: Tree,
}

impl SledKvStore {
    pub fn open(db: &Db, tree_name: &str) -> Result<Self, KvError> {
        let tree = db.open_tree(tree_name).map_err(to_backend_err)?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl KvStore for SledKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        Ok(self
            .tree
            .get(key)
            .map_err(to_backend_err)?
            .map(|ivec| Bytes::copy_from_slice(&ivec)))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.tree.insert(key, value.as_ref()).map_err(to_backend_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.tree.remove(key).map_err(to_backend_err)?;
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (k, _) = item.map_err(to_backend_err)?;
            out.push(String::from_utf8_lossy(&k).into_owned());
        }
        Ok(out)
    }
}

// A hand-rolled, dependency-free record encoding: this backend is optional and meant to be
// simple to audit, so it avoids pulling in a serialization crate just for one internal format.
fn encode_record(r: &QueueRecord) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&r.id.to_be_bytes());
    buf.extend_from_slice(&r.order_number.to_be_bytes());
    buf.push(r.handled as u8);
    let expiry_millis: i64 = r
        .lock_expires_at
        .map(|t| {
            t.duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as i64
        })
        .unwrap_or(-1);
    buf.extend_from_slice(&expiry_millis.to_be_bytes());
    write_lp_bytes(&mut buf, r.lock_owner.as_deref().unwrap_or("").as_bytes());
    write_lp_bytes(&mut buf, r.unique_key.as_bytes());
    write_lp_bytes(&mut buf, &r.payload);
    buf
}

fn write_lp_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn read_lp_bytes(buf: &[u8], pos: &mut usize) -> Vec<u8> {
    let len = u32::from_be_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    let out = buf[*pos..*pos + len].to_vec();
    *pos += len;
    out
}

fn decode_record(buf: &[u8]) -> QueueRecord {
    let mut pos = 0;
    let id = u64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let order_number = i64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let handled = buf[pos] != 0;
    pos += 1;
    let expiry_millis = i64::from_be_bytes(buf[pos..pos + 8].try_into().unwrap());
    pos += 8;
    let lock_expires_at = if expiry_millis < 0 {
        None
    } else {
        Some(UNIX_EPOCH + Duration::from_millis(expiry_millis as u64))
    };
    let lock_owner_bytes = read_lp_bytes(buf, &mut pos);
    let lock_owner = if lock_owner_bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&lock_owner_bytes).into_owned())
    };
    let unique_key = String::from_utf8_lossy(&read_lp_bytes(buf, &mut pos)).into_owned();
    let payload = Bytes::from(read_lp_bytes(buf, &mut pos));

    QueueRecord {
        id,
        unique_key,
        order_number,
        handled,
        lock_owner,
        lock_expires_at,
        payload,
    }
}

struct SledQueueInner {
    next_id: AtomicU64,
}

/// A durable `QueueBackend` built on `sled`. Suitable for a single long-running worker process
/// that must resume a partially-completed crawl after a restart; cross-process/cross-host
/// deployments should present a remote implementation of `QueueBackend` instead, honoring the
/// same semantics documented on the trait.
#[derive(Clone)]
pub struct SledQueueBackend {
    records: Tree,
    unique_keys: Tree,
    lock_guard: Arc<Mutex<()>>,
    next_id: Arc<SledQueueInner>,
}

impl SledQueueBackend {
    pub fn open(db: &Db) -> Result<Self, KvError> {
        let records = db.open_tree("queue_records").map_err(to_backend_err)?;
        let unique_keys = db.open_tree("queue_unique_keys").map_err(to_backend_err)?;
        let next_id = records
            .iter()
            .keys()
            .filter_map(|k| k.ok())
            .map(|k| u64::from_be_bytes(k.as_ref().try_into().unwrap()))
            .max()
            .map(|m| m + 1)
            .unwrap_or(1);
        Ok(Self {
            records,
            unique_keys,
            lock_guard: Arc::new(Mutex::new(())),
            next_id: Arc::new(SledQueueInner {
                next_id: AtomicU64::new(next_id),
            }),
        })
    }

    fn get_record(&self, id: RequestId) -> Result<Option<QueueRecord>, KvError> {
        Ok(self
            .records
            .get(id.to_be_bytes())
            .map_err(to_backend_err)?
            .map(|v| decode_record(&v)))
    }

    fn put_record(&self, record: &QueueRecord) -> Result<(), KvError> {
        self.records
            .insert(record.id.to_be_bytes(), encode_record(record))
            .map_err(to_backend_err)?;
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for SledQueueBackend {
    async fn add_request(
        &self,
        unique_key: &str,
        order_number: i64,
        payload: Bytes,
    ) -> Result<AddOutcome, KvError> {
        let _guard = self.lock_guard.lock();
        if let Some(existing) = self
            .unique_keys
            .get(unique_key)
            .map_err(to_backend_err)?
        {
            let id = u64::from_be_bytes(existing.as_ref().try_into().unwrap());
            let was_already_handled = self
                .get_record(id)?
                .map(|r| r.handled)
                .unwrap_or(false);
            return Ok(AddOutcome {
                id,
                was_already_present: true,
                was_already_handled,
            });
        }

        let id = self.next_id.next_id.fetch_add(1, Ordering::SeqCst);
        self.unique_keys
            .insert(unique_key, &id.to_be_bytes())
            .map_err(to_backend_err)?;
        self.put_record(&QueueRecord {
            id,
            unique_key: unique_key.to_string(),
            order_number,
            handled: false,
            lock_owner: None,
            lock_expires_at: None,
            payload,
        })?;
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
        let mut entries: Vec<QueueRecord> = self
            .records
            .iter()
            .values()
            .filter_map(|v| v.ok())
            .map(|v| decode_record(&v))
            .collect();
        entries.sort_by_key(|r| r.order_number);
        entries.truncate(limit);
        Ok(QueueHead {
            entries,
            modified_at: SystemTime::now(),
        })
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<QueueRecord>, KvError> {
        self.get_record(id)
    }

    async fn update_request(&self, id: RequestId, fields: RequestUpdate) -> Result<(), KvError> {
        let _guard = self.lock_guard.lock();
        let mut record = self.get_record(id)?.ok_or(KvError::NotFound { id })?;
        if let Some(handled) = fields.handled {
            record.handled = handled;
        }
        if let Some(payload) = fields.payload {
            record.payload = payload;
        }
        self.put_record(&record)
    }

    async fn prolong_request_lock(
        &self,
        id: RequestId,
        token: &str,
        lock_secs: u64,
        reassign_order: Option<i64>,
    ) -> Result<SystemTime, KvError> {
        let _guard = self.lock_guard.lock();
        let mut record = self.get_record(id)?.ok_or(KvError::NotFound { id })?;
        let now = SystemTime::now();
        let held = record.lock_owner.as_deref() == Some(token)
            && record.lock_expires_at.map(|e| e > now).unwrap_or(false);
        if !held {
            return Err(KvError::LockNotHeld { id });
        }
        let new_expiry = now + Duration::from_secs(lock_secs);
        record.lock_expires_at = Some(new_expiry);
        if let Some(order_number) = reassign_order {
            record.order_number = order_number;
        }
        self.put_record(&record)?;
        Ok(new_expiry)
    }

    async fn delete_request_lock(
        &self,
        id: RequestId,
        token: &str,
        reassign_order: Option<i64>,
    ) -> Result<(), KvError> {
        let _guard = self.lock_guard.lock();
        let mut record = self.get_record(id)?.ok_or(KvError::NotFound { id })?;
        let now = SystemTime::now();
        let held = record.lock_owner.as_deref() == Some(token)
            && record.lock_expires_at.map(|e| e > now).unwrap_or(false);
        if !held {
            return Err(KvError::LockNotHeld { id });
        }
        record.lock_owner = None;
        record.lock_expires_at = None;
        if let Some(order_number) = reassign_order {
            record.order_number = order_number;
        }
        self.put_record(&record)
    }

    async fn delete_request(&self, id: RequestId) -> Result<(), KvError> {
        let _guard = self.lock_guard.lock();
        if let Some(record) = self.get_record(id)? {
            self.unique_keys
                .remove(&record.unique_key)
                .map_err(to_backend_err)?;
        }
        self.records.remove(id.to_be_bytes()).map_err(to_backend_err)?;
        Ok(())
    }

    async fn list_and_lock_head(
        &self,
        limit: usize,
        lock_secs: u64,
        token: &str,
    ) -> Result<Vec<QueueRecord>, KvError> {
        let _guard = self.lock_guard.lock();
        let now = SystemTime::now();
        let expiry = now + Duration::from_secs(lock_secs);

        let mut candidates: Vec<QueueRecord> = self
            .records
            .iter()
            .values()
            .filter_map(|v| v.ok())
            .map(|v| decode_record(&v))
            .filter(|r| !r.handled && r.lock_expires_at.map(|e| e <= now).unwrap_or(true))
            .collect();
        candidates.sort_by_key(|r| r.order_number);
        candidates.truncate(limit);

        for record in &mut candidates {
            record.lock_owner = Some(token.to_string());
            record.lock_expires_at = Some(expiry);
            self.put_record(record)?;
        }
        Ok(candidates)
    }
}
