// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A single session: a cookie jar plus a health score that decides when it gets retired.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use cookie_store::CookieStore;
use parking_lot::Mutex;
use serde_json::Value;

/// Tunables shared by every session a pool creates.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// How long after creation a session is considered stale, regardless of usage.
    pub max_age: Duration,
    /// Number of uses after which a session is retired even if otherwise healthy.
    pub max_usage_count: u32,
    /// Error score at or above which a session is blocked.
    pub max_error_score: f64,
    /// Amount `mark_good` subtracts from the error score, floored at zero.
    pub error_score_decrement: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(50 * 60),
            max_usage_count: 50,
            max_error_score: 3.0,
            error_score_decrement: 0.5,
        }
    }
}

pub struct Session {
    id: String,
    cookie_store: Mutex<CookieStore>,
    user_data: Mutex<Value>,
    created_at: SystemTime,
    expires_at: SystemTime,
    usage_count: AtomicU32,
    max_usage_count: u32,
    error_score: Mutex<f64>,
    max_error_score: f64,
    error_score_decrement: f64,
    blocked: AtomicBool,
}

impl Session {
    pub fn new(id: String, options: SessionOptions) -> Self {
        let created_at = SystemTime::now();
        Self {
            id,
            cookie_store: Mutex::new(CookieStore::default()),
            user_data: Mutex::new(Value::Null),
            created_at,
            expires_at: created_at + options.max_age,
            usage_count: AtomicU32::new(0),
            max_usage_count: options.max_usage_count,
            error_score: Mutex::new(0.0),
            max_error_score: options.max_error_score,
            error_score_decrement: options.error_score_decrement,
            blocked: AtomicBool::new(false),
        }
    }

    /// Reconstructs a session from persisted state, restoring its original creation time (so
    /// expiry is judged from when it was first created, not from the moment it was reloaded),
    /// usage count, error score, and blocked flag directly rather than replaying history through
    /// `mark_good`/`mark_bad`.
    pub fn restore(
        id: String,
        options: SessionOptions,
        created_at: SystemTime,
        usage_count: u32,
        error_score: f64,
        blocked: bool,
    ) -> Self {
        Self {
            id,
            cookie_store: Mutex::new(CookieStore::default()),
            user_data: Mutex::new(Value::Null),
            created_at,
            expires_at: created_at + options.max_age,
            usage_count: AtomicU32::new(usage_count),
            max_usage_count: options.max_usage_count,
            error_score: Mutex::new(error_score),
            max_error_score: options.max_error_score,
            error_score_decrement: options.error_score_decrement,
            blocked: AtomicBool::new(blocked),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count.load(Ordering::Relaxed)
    }

    pub fn error_score(&self) -> f64 {
        *self.error_score.lock()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    /// Whether this session should still be handed out. Combines the explicit `blocked` flag,
    /// time-based expiry, and usage-count expiry.
    pub fn is_usable(&self) -> bool {
        !self.is_blocked()
            && SystemTime::now() < self.expires_at
            && self.usage_count.load(Ordering::Relaxed) < self.max_usage_count
    }

    pub fn cookie_store(&self) -> parking_lot::MutexGuard<'_, CookieStore> {
        self.cookie_store.lock()
    }

    pub fn user_data(&self) -> Value {
        self.user_data.lock().clone()
    }

    pub fn set_user_data(&self, value: Value) {
        *self.user_data.lock() = value;
    }

    /// Records a successful use: bumps the usage counter and eases the error score back down.
    pub fn mark_good(&self) {
        self.usage_count.fetch_add(1, Ordering::Relaxed);
        let mut score = self.error_score.lock();
        *score = (*score - self.error_score_decrement).max(0.0);
    }

    /// Records a failed use with the given weight and blocks the session once its error score
    /// crosses `max_error_score`.
    pub fn mark_bad(&self, weight: f64) {
        self.usage_count.fetch_add(1, Ordering::Relaxed);
        let mut score = self.error_score.lock();
        *score += weight;
        if *score >= self.max_error_score {
            self.blocked.store(true, Ordering::Relaxed);
        }
    }

    /// Immediately blocks the session, for responses that unambiguously mean "this identity is
    /// burned" (e.g. a blocking status code) rather than an ordinary transient failure.
    pub fn retire(&self) {
        self.blocked.store(true, Ordering::Relaxed);
    }

    pub(crate) fn load_cookie_store(&self, store: CookieStore) {
        *self.cookie_store.lock() = store;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_bad_blocks_once_error_score_crosses_max() {
        let session = Session::new("s1".into(), SessionOptions::default());
        assert!(session.is_usable());
        session.mark_bad(1.0);
        session.mark_bad(1.0);
        assert!(session.is_usable());
        session.mark_bad(1.5);
        assert!(!session.is_usable());
        assert!(session.is_blocked());
    }

    #[test]
    fn mark_good_decays_error_score_but_not_below_zero() {
        let session = Session::new("s1".into(), SessionOptions::default());
        session.mark_bad(1.0);
        session.mark_good();
        session.mark_good();
        assert_eq!(session.error_score(), 0.0);
    }

    #[test]
    fn restore_preserves_error_score_usage_count_and_creation_time() {
        let created_at = SystemTime::now() - Duration::from_secs(60);
        let session = Session::restore("s1".into(), SessionOptions::default(), created_at, 7, 2.5, false);
        assert_eq!(session.created_at(), created_at);
        assert_eq!(session.usage_count(), 7);
        assert_eq!(session.error_score(), 2.5);
        assert!(!session.is_blocked());
    }

    #[test]
    fn restore_past_expiry_is_not_usable() {
        let created_at = SystemTime::now() - Duration::from_secs(3600);
        let options = SessionOptions {
            max_age: Duration::from_secs(60),
            ..SessionOptions::default()
        };
        let session = Session::restore("s1".into(), options, created_at, 0, 0.0, false);
        assert!(!session.is_usable());
    }

    #[test]
    fn usage_count_expiry_retires_session() {
        let options = SessionOptions {
            max_usage_count: 2,
            ..SessionOptions::default()
        };
        let session = Session::new("s1".into(), options);
        session.mark_good();
        session.mark_good();
        assert!(!session.is_usable());
    }
}
