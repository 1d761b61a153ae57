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

//! A finite, upfront-known sequence of requests with checkpointed consumption state.
//!
//! Unlike `request_queue`, the item set here is fixed for the run's lifetime: callers supply the
//! full `Vec<T>` once, and this crate only tracks which indices have been fetched, are in
//! progress, or are done. State tracking uses a pair of `fixedbitset::FixedBitSet`s rather than
//! hash sets, the same way a dependency graph walk tracks visited/walked node state over a
//! fixed-size index space.

use std::collections::VecDeque;
use std::time::Duration;

use kvstore::KvStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use task_executor::Executor;
use tokio::task::JoinHandle;

const DEFAULT_STATE_KEY: &str = "SDK_REQUEST_LIST_STATE";

struct ListState {
    next_index: usize,
    in_progress: fixedbitset::FixedBitSet,
    handled: fixedbitset::FixedBitSet,
    retry_queue: VecDeque<usize>,
}

impl ListState {
    fn new(len: usize) -> Self {
        Self {
            next_index: 0,
            in_progress: fixedbitset::FixedBitSet::with_capacity(len),
            handled: fixedbitset::FixedBitSet::with_capacity(len),
            retry_queue: VecDeque::new(),
        }
    }
}

/// A fixed sequence of items of type `T`, handed out one at a time in order (reclaimed items cut
/// ahead of not-yet-seen ones, matching `request_queue`'s forefront intuition).
pub struct RequestList<T> {
    items: Vec<T>,
    state: Mutex<ListState>,
    state_key: String,
}

impl<T: Clone + Send + Sync + 'static> RequestList<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self::with_state_key(items, DEFAULT_STATE_KEY.to_string())
    }

    pub fn with_state_key(items: Vec<T>, state_key: String) -> Self {
        let state = ListState::new(items.len());
        Self {
            items,
            state: Mutex::new(state),
            state_key,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Hands out the next not-yet-in-progress item, preferring reclaimed indices over advancing.
    pub fn fetch_next(&self) -> Option<(usize, T)> {
        let mut state = self.state.lock();
        if let Some(index) = state.retry_queue.pop_front() {
            state.in_progress.insert(index);
            return Some((index, self.items[index].clone()));
        }
        if state.next_index < self.items.len() {
            let index = state.next_index;
            state.next_index += 1;
            state.in_progress.insert(index);
            return Some((index, self.items[index].clone()));
        }
        None
    }

    pub fn mark_handled(&self, index: usize) {
        let mut state = self.state.lock();
        state.in_progress.set(index, false);
        state.handled.insert(index);
    }

    /// Returns an in-progress item to the front of the queue, to be fetched again (e.g. on retry).
    pub fn reclaim(&self, index: usize) {
        let mut state = self.state.lock();
        state.in_progress.set(index, false);
        state.retry_queue.push_back(index);
    }

    /// True when there is currently nothing fetchable. Items still mid-flight (in progress) don't
    /// count as "available", but the list is not necessarily finished: they may yet be reclaimed.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.retry_queue.is_empty() && state.next_index >= self.items.len()
    }

    /// True once every item has been marked handled and nothing remains in flight.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.handled.count_ones(..) == self.items.len()
            && state.in_progress.count_ones(..) == 0
            && state.retry_queue.is_empty()
    }

    fn checkpoint(&self) -> PersistedState {
        let state = self.state.lock();
        PersistedState {
            next_index: state.next_index,
            in_progress: state.in_progress.ones().collect(),
            handled: state.handled.ones().collect(),
            retry_queue: state.retry_queue.iter().copied().collect(),
        }
    }

    pub async fn persist(&self, kv: &dyn KvStore) -> Result<(), kvstore::KvError> {
        let checkpoint = self.checkpoint();
        let bytes = serde_json::to_vec(&checkpoint)
            .map_err(|e| kvstore::KvError::Backend(format!("serializing request list state: {e}")))?;
        kv.set(&self.state_key, bytes::Bytes::from(bytes)).await
    }

    /// Restores consumption state for a freshly reconstructed `items` vector. Any previously
    /// in-progress index is treated as reclaimable, since whatever worker held it did not finish.
    pub async fn load(
        items: Vec<T>,
        kv: &dyn KvStore,
        state_key: String,
    ) -> Result<Self, kvstore::KvError> {
        let list = Self::with_state_key(items, state_key);
        let Some(bytes) = kv.get(&list.state_key).await? else {
            return Ok(list);
        };
        let checkpoint: PersistedState = match serde_json::from_slice(&bytes) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("ignoring unparseable request list state: {e}");
                return Ok(list);
            }
        };
        let mut state = list.state.lock();
        state.next_index = checkpoint.next_index;
        for index in checkpoint.handled {
            state.handled.insert(index);
        }
        for index in checkpoint.in_progress {
            state.retry_queue.push_back(index);
        }
        for index in checkpoint.retry_queue {
            state.retry_queue.push_back(index);
        }
        drop(state);
        Ok(list)
    }
}

impl<T: Clone + Send + Sync + 'static> RequestList<T> {
    /// Spawns a background task that persists consumption state on a fixed interval until the
    /// list is finished. Mirrors `request_queue`'s own checkpointing loop; the two are separate so
    /// a crawler using only one of the two still pays for just one timer.
    pub fn spawn_persist_loop(
        self: std::sync::Arc<Self>,
        executor: &Executor,
        kv: std::sync::Arc<dyn KvStore>,
        interval: Duration,
    ) -> JoinHandle<()> {
        executor.native_spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.persist(kv.as_ref()).await {
                    log::warn!("failed to persist request list state: {e}");
                }
                if self.is_finished() {
                    break;
                }
            }
        })
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    next_index: usize,
    in_progress: Vec<usize>,
    handled: Vec<usize>,
    retry_queue: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryKvStore;

    #[test]
    fn fetches_in_order_then_exhausts() {
        let list = RequestList::new(vec!["a", "b", "c"]);
        assert_eq!(list.fetch_next(), Some((0, "a")));
        assert_eq!(list.fetch_next(), Some((1, "b")));
        assert_eq!(list.fetch_next(), Some((2, "c")));
        assert_eq!(list.fetch_next(), None);
        assert!(list.is_empty());
        assert!(!list.is_finished());
    }

    #[test]
    fn reclaimed_items_are_fetched_before_new_ones() {
        let list = RequestList::new(vec!["a", "b", "c"]);
        let (idx, _) = list.fetch_next().unwrap();
        list.reclaim(idx);
        let (next_idx, next_item) = list.fetch_next().unwrap();
        assert_eq!(next_idx, idx);
        assert_eq!(next_item, "a");
    }

    #[test]
    fn finished_only_once_all_handled() {
        let list = RequestList::new(vec!["a", "b"]);
        let (i0, _) = list.fetch_next().unwrap();
        let (i1, _) = list.fetch_next().unwrap();
        assert!(!list.is_finished());
        list.mark_handled(i0);
        assert!(!list.is_finished());
        list.mark_handled(i1);
        assert!(list.is_finished());
    }

    #[tokio::test]
    async fn persist_then_load_resumes_from_checkpoint() {
        let kv = MemoryKvStore::new();
        let list = RequestList::with_state_key(vec!["a", "b", "c"], "test_key".to_string());
        let (i0, _) = list.fetch_next().unwrap();
        list.mark_handled(i0);
        let (i1, _) = list.fetch_next().unwrap();
        // i1 stays in progress, simulating a worker that died before finishing it.
        let _ = i1;
        list.persist(&kv).await.unwrap();

        let restored = RequestList::load(
            vec!["a", "b", "c"],
            &kv,
            "test_key".to_string(),
        )
        .await
        .unwrap();
        assert!(restored.is_finished() == false);
        // The dangling in-progress item is now reclaimable.
        let (idx, _) = restored.fetch_next().unwrap();
        assert_eq!(idx, i1);
    }
}
