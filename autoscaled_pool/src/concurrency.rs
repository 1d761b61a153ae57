// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A resizable concurrency limiter.
//!
//! A waiter queue plus an available-permit count is the same idea an older futures 0.1 semaphore
//! would implement against manual `Task`-polling; under async/await that protocol doesn't exist
//! any more, so this is built directly on `tokio::sync::Notify`, the modern equivalent. The one
//! capability a plain semaphore doesn't need and this does is resizing the limit at runtime, since
//! the whole point of this crate is to move that limit up and down while the pool is live.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Inner {
    in_use: AtomicUsize,
    target: AtomicUsize,
    notify: Notify,
}

/// Shared handle to a concurrency limit that can be raised or lowered while permits are held.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
}

impl ConcurrencyLimiter {
    pub fn new(initial_target: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                in_use: AtomicUsize::new(0),
                target: AtomicUsize::new(initial_target),
                notify: Notify::new(),
            }),
        }
    }

    pub fn target(&self) -> usize {
        self.inner.target.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }

    /// Changes the concurrency ceiling. Lowering it does not preempt already-running tasks; it
    /// just stops new ones from starting until usage drops back under the new target.
    pub fn set_target(&self, new_target: usize) {
        self.inner.target.store(new_target, Ordering::Relaxed);
        self.inner.notify.notify_waiters();
    }

    /// Waits until a slot under the current target is available, then reserves it.
    pub async fn acquire(&self) -> ConcurrencyPermit {
        loop {
            if self.try_reserve() {
                return ConcurrencyPermit {
                    inner: self.inner.clone(),
                };
            }
            self.inner.notify.notified().await;
        }
    }

    fn try_reserve(&self) -> bool {
        loop {
            let in_use = self.inner.in_use.load(Ordering::Relaxed);
            let target = self.inner.target.load(Ordering::Relaxed);
            if in_use >= target {
                return false;
            }
            if self
                .inner
                .in_use
                .compare_exchange(in_use, in_use + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }
}

pub struct ConcurrencyPermit {
    inner: Arc<Inner>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.inner.in_use.fetch_sub(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limits_to_target_concurrency() {
        let limiter = ConcurrencyLimiter::new(1);
        let _first = limiter.acquire().await;
        assert_eq!(limiter.in_use(), 1);

        let limiter2 = limiter.clone();
        let blocked = tokio::spawn(async move {
            let _second = limiter2.acquire().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        drop(_first);
        blocked.await.unwrap();
    }

    #[tokio::test]
    async fn raising_target_wakes_waiters() {
        let limiter = ConcurrencyLimiter::new(1);
        let _first = limiter.acquire().await;
        let limiter2 = limiter.clone();
        let acquired = tokio::spawn(async move {
            let _second = limiter2.acquire().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        limiter.set_target(2);
        acquired.await.unwrap();
    }
}
