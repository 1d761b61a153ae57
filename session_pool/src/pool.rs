// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A rotating collection of sessions: a round-robin index into a vector of backends, health
//! reported back by the caller, unhealthy ones skipped — the same shape a serverset uses to
//! round-robin over healthy backends. Sessions do not ease back into rotation the way a serverset's
//! backends do, though — once blocked, a session is permanently retired and replaced, since a
//! burned cookie jar has no backoff that makes it trustworthy again.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cookie_store::CookieStore;
use kvstore::KvStore;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{Session, SessionOptions};

const STATE_KEY: &str = "SDK_SESSION_POOL_STATE";

#[derive(Clone, Copy, Debug)]
pub struct SessionPoolOptions {
    pub max_pool_size: usize,
    pub session_options: SessionOptions,
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            session_options: SessionOptions::default(),
        }
    }
}

pub struct SessionPool {
    sessions: Mutex<Vec<Arc<Session>>>,
    next: AtomicUsize,
    options: SessionPoolOptions,
}

impl SessionPool {
    pub fn new(options: SessionPoolOptions) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            options,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Drops sessions that are no longer usable (blocked, or expired by age or usage count).
    fn purge_unusable(&self) {
        self.sessions.lock().retain(|s| s.is_usable());
    }

    /// Returns a session to use next. Grows the pool (fresh session, zero error score) while under
    /// `max_pool_size`; once full, round-robins over the existing, already-healthy sessions.
    pub fn get_session(&self) -> Arc<Session> {
        self.purge_unusable();

        let mut sessions = self.sessions.lock();
        if sessions.len() < self.options.max_pool_size {
            let id = new_session_id();
            let session = Arc::new(Session::new(id, self.options.session_options));
            sessions.push(session.clone());
            return session;
        }

        let len = sessions.len();
        let index = self.next.fetch_add(1, Ordering::Relaxed) % len;
        sessions[index].clone()
    }

    pub fn mark_good(&self, session: &Session) {
        session.mark_good();
    }

    pub fn mark_bad(&self, session: &Session, weight: f64) {
        session.mark_bad(weight);
    }

    /// Retires a session outright, for responses that mean the identity itself is burned (e.g. a
    /// configured blocking status code) rather than an ordinary transient failure.
    pub fn retire_on_blocked_status_code(&self, session: &Session) {
        session.retire();
    }

    pub async fn persist(&self, kv: &dyn KvStore) -> Result<(), kvstore::KvError> {
        self.purge_unusable();
        let records: Vec<PersistedSession> = self
            .sessions
            .lock()
            .iter()
            .map(|s| PersistedSession::from_session(s))
            .collect();
        let bytes = serde_json::to_vec(&records)
            .map_err(|e| kvstore::KvError::Backend(format!("serializing session pool: {e}")))?;
        kv.set(STATE_KEY, bytes::Bytes::from(bytes)).await
    }

    pub async fn load(kv: &dyn KvStore, options: SessionPoolOptions) -> Result<Self, kvstore::KvError> {
        let pool = Self::new(options);
        let Some(bytes) = kv.get(STATE_KEY).await? else {
            return Ok(pool);
        };
        let records: Vec<PersistedSession> = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("ignoring unparseable session pool state: {e}");
                return Ok(pool);
            }
        };
        let now = SystemTime::now();
        let mut sessions = pool.sessions.lock();
        for record in records {
            let session = record.into_session(options.session_options);
            if session.expires_at() > now {
                sessions.push(Arc::new(session));
            }
        }
        drop(sessions);
        Ok(pool)
    }
}

fn new_session_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: u64 = rng.gen();
    format!("session_{suffix:016x}")
}

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    id: String,
    created_at_epoch_ms: u64,
    usage_count: u32,
    error_score: f64,
    blocked: bool,
    user_data: Value,
    cookie_jar_json: Option<String>,
}

impl PersistedSession {
    fn from_session(session: &Arc<Session>) -> Self {
        let mut buf = Vec::new();
        let cookie_jar_json = session
            .cookie_store()
            .save_json(&mut buf)
            .map_err(|e| log::warn!("failed to serialize cookie jar for {}: {e}", session.id()))
            .ok()
            .map(|()| String::from_utf8_lossy(&buf).into_owned());

        Self {
            id: session.id().to_string(),
            created_at_epoch_ms: session
                .created_at()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_millis() as u64,
            usage_count: session.usage_count(),
            error_score: session.error_score(),
            blocked: session.is_blocked(),
            user_data: session.user_data(),
            cookie_jar_json,
        }
    }

    fn into_session(self, options: SessionOptions) -> Session {
        let created_at = UNIX_EPOCH + Duration::from_millis(self.created_at_epoch_ms);
        let session = Session::restore(
            self.id,
            options,
            created_at,
            self.usage_count,
            self.error_score,
            self.blocked,
        );
        session.set_user_data(self.user_data);
        if let Some(json) = self.cookie_jar_json {
            if let Ok(store) = CookieStore::load_json(Cursor::new(json.into_bytes())) {
                session.load_cookie_store(store);
            }
        }
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryKvStore;

    #[test]
    fn pool_grows_until_max_size_then_rotates() {
        let pool = SessionPool::new(SessionPoolOptions {
            max_pool_size: 2,
            ..SessionPoolOptions::default()
        });
        let a = pool.get_session();
        let b = pool.get_session();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.len(), 2);

        let c = pool.get_session();
        assert!(c.id() == a.id() || c.id() == b.id());
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn blocked_sessions_are_purged_and_replaced() {
        let pool = SessionPool::new(SessionPoolOptions {
            max_pool_size: 1,
            ..SessionPoolOptions::default()
        });
        let a = pool.get_session();
        pool.retire_on_blocked_status_code(&a);
        let b = pool.get_session();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let kv = MemoryKvStore::new();
        let pool = SessionPool::new(SessionPoolOptions::default());
        let session = pool.get_session();
        session.set_user_data(serde_json::json!({"k": "v"}));
        pool.mark_good(&session);
        pool.persist(&kv).await.unwrap();

        let restored = SessionPool::load(&kv, SessionPoolOptions::default()).await.unwrap();
        assert_eq!(restored.len(), 1);
        let restored_session = restored.sessions.lock()[0].clone();
        assert_eq!(restored_session.id(), session.id());
        assert_eq!(restored_session.user_data(), serde_json::json!({"k": "v"}));
    }
}
