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

//! Per-crawl statistics: counters, latency distributions, and error fingerprint tallies.
//!
//! Counters live behind a `parking_lot::Mutex`, latency is tracked with an
//! `hdrhistogram::Histogram` (which yields min/max/sum for free and can still answer percentile
//! queries later), and the persisted snapshot is a plain JSON record.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use fnv::FnvHashMap as HashMap;
use hdrhistogram::Histogram;
use kvstore::KvStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const STATS_KEY_PREFIX: &str = "SDK_CRAWLER_STATISTICS_";

/// The stable key statistics for crawl `run_id` are persisted under.
pub fn key_for(run_id: &str) -> String {
    format!("{STATS_KEY_PREFIX}{run_id}")
}

/// Collapses an error down to a structural fingerprint for deduplicated counting. Rust has no
/// portable runtime stack capture outside of `backtrace`-style crates, so the fingerprint here is
/// the error's classification tag plus a bounded message prefix, which is enough to collapse e.g.
/// "connection refused to host A" and "...to host B" into one bucket while still separating
/// genuinely distinct failure modes.
pub fn fingerprint(kind: &str, message: &str) -> String {
    const PREFIX_LEN: usize = 80;
    let prefix: String = message.chars().take(PREFIX_LEN).collect();
    format!("{kind}: {prefix}")
}

#[derive(Default)]
struct Counters {
    finished: u64,
    failed: u64,
    retried: u64,
}

/// A single crawl's statistics. Every call site in this workspace holds a single long-lived
/// instance behind its own `Arc`, so plain interior mutability via `parking_lot::Mutex` fields is
/// enough here.
pub struct Statistics {
    counters: Mutex<Counters>,
    latency_finished_ms: Mutex<Histogram<u64>>,
    latency_failed_ms: Mutex<Histogram<u64>>,
    retry_histogram: Mutex<BTreeMap<u32, u64>>,
    status_codes: Mutex<HashMap<u16, u64>>,
    final_errors: Mutex<HashMap<String, u64>>,
    retry_errors: Mutex<HashMap<String, u64>>,
    started_at: Mutex<Option<SystemTime>>,
    finished_at: Mutex<Option<SystemTime>>,
}

/// A JSON-serializable point-in-time snapshot, used both for the persisted record and for
/// reporting to callers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub requests_finished: u64,
    pub requests_failed: u64,
    pub requests_retried: u64,
    pub latency_finished_min_ms: Option<u64>,
    pub latency_finished_max_ms: Option<u64>,
    pub latency_finished_sum_ms: u64,
    pub latency_failed_min_ms: Option<u64>,
    pub latency_failed_max_ms: Option<u64>,
    pub latency_failed_sum_ms: u64,
    pub retry_histogram: BTreeMap<u32, u64>,
    pub status_codes: BTreeMap<u16, u64>,
    pub final_errors: BTreeMap<String, u64>,
    pub retry_errors: BTreeMap<String, u64>,
    pub started_at_epoch_ms: Option<u64>,
    pub finished_at_epoch_ms: Option<u64>,
    /// hdrhistogram V2-deflate-serialized, base64-encoded latency distributions, for callers that
    /// want percentiles rather than just min/max/sum.
    pub latency_finished_histogram_b64: Option<String>,
    pub latency_failed_histogram_b64: Option<String>,
}

impl StatisticsSnapshot {
    /// Always equal to `requests_finished + requests_failed`.
    pub fn requests_total(&self) -> u64 {
        self.requests_finished + self.requests_failed
    }
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new(3).expect("hdrhistogram significant-figures parameter is in range")
}

fn encode_histogram(h: &Histogram<u64>) -> Option<String> {
    use hdrhistogram::serialization::V2DeflateSerializer;
    let mut buf = Vec::new();
    V2DeflateSerializer::new()
        .serialize(h, &mut buf)
        .map_err(|e| log::warn!("failed to serialize latency histogram: {e}"))
        .ok()?;
    Some(base64::engine::general_purpose::STANDARD.encode(buf))
}

fn decode_histogram(encoded: &str) -> Option<Histogram<u64>> {
    use hdrhistogram::serialization::Deserializer;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| log::warn!("failed to base64-decode latency histogram: {e}"))
        .ok()?;
    Deserializer::new()
        .deserialize(&mut std::io::Cursor::new(bytes))
        .map_err(|e| log::warn!("failed to deserialize latency histogram: {e}"))
        .ok()
}

fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as u64
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            latency_finished_ms: Mutex::new(new_histogram()),
            latency_failed_ms: Mutex::new(new_histogram()),
            retry_histogram: Mutex::new(BTreeMap::new()),
            status_codes: Mutex::new(HashMap::default()),
            final_errors: Mutex::new(HashMap::default()),
            retry_errors: Mutex::new(HashMap::default()),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        *self.started_at.lock() = Some(SystemTime::now());
    }

    pub fn finish(&self) {
        *self.finished_at.lock() = Some(SystemTime::now());
    }

    pub fn record_finished(&self, latency: Duration) {
        self.counters.lock().finished += 1;
        let _ = self
            .latency_finished_ms
            .lock()
            .record(latency.as_millis() as u64);
    }

    pub fn record_final_failure(&self, latency: Duration, retry_count: u32, kind: &str, message: &str) {
        self.counters.lock().failed += 1;
        let _ = self
            .latency_failed_ms
            .lock()
            .record(latency.as_millis() as u64);
        *self.retry_histogram.lock().entry(retry_count).or_insert(0) += 1;
        let key = fingerprint(kind, message);
        *self.final_errors.lock().entry(key).or_insert(0) += 1;
    }

    pub fn record_retry(&self, kind: &str, message: &str) {
        self.counters.lock().retried += 1;
        let key = fingerprint(kind, message);
        *self.retry_errors.lock().entry(key).or_insert(0) += 1;
    }

    pub fn record_status_code(&self, code: u16) {
        *self.status_codes.lock().entry(code).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let counters = self.counters.lock();
        let finished_hist = self.latency_finished_ms.lock();
        let failed_hist = self.latency_failed_ms.lock();

        StatisticsSnapshot {
            requests_finished: counters.finished,
            requests_failed: counters.failed,
            requests_retried: counters.retried,
            latency_finished_min_ms: (finished_hist.len() > 0).then(|| finished_hist.min()),
            latency_finished_max_ms: (finished_hist.len() > 0).then(|| finished_hist.max()),
            latency_finished_sum_ms: (finished_hist.mean() * finished_hist.len() as f64) as u64,
            latency_failed_min_ms: (failed_hist.len() > 0).then(|| failed_hist.min()),
            latency_failed_max_ms: (failed_hist.len() > 0).then(|| failed_hist.max()),
            latency_failed_sum_ms: (failed_hist.mean() * failed_hist.len() as f64) as u64,
            retry_histogram: self.retry_histogram.lock().clone(),
            status_codes: self.status_codes.lock().iter().map(|(k, v)| (*k, *v)).collect(),
            final_errors: self.final_errors.lock().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            retry_errors: self.retry_errors.lock().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            started_at_epoch_ms: self.started_at.lock().map(epoch_ms),
            finished_at_epoch_ms: self.finished_at.lock().map(epoch_ms),
            latency_finished_histogram_b64: encode_histogram(&finished_hist),
            latency_failed_histogram_b64: encode_histogram(&failed_hist),
        }
    }

    /// Persists the current snapshot under `key_for(run_id)`.
    pub async fn persist(&self, kv: &dyn KvStore, run_id: &str) -> Result<(), kvstore::KvError> {
        let snapshot = self.snapshot();
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| kvstore::KvError::Backend(format!("serializing statistics: {e}")))?;
        kv.set(&key_for(run_id), bytes::Bytes::from(bytes)).await
    }

    /// Restores statistics persisted by `persist`, tolerant of a missing key (fresh crawl) and of
    /// missing optional fields (schema evolution).
    pub async fn load(kv: &dyn KvStore, run_id: &str) -> Result<Self, kvstore::KvError> {
        let stats = Self::new();
        let Some(bytes) = kv.get(&key_for(run_id)).await? else {
            return Ok(stats);
        };
        let snapshot: StatisticsSnapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("ignoring unparseable statistics snapshot for {run_id}: {e}");
                return Ok(stats);
            }
        };
        stats.restore_from(snapshot);
        Ok(stats)
    }

    fn restore_from(&self, snapshot: StatisticsSnapshot) {
        let mut counters = self.counters.lock();
        counters.finished = snapshot.requests_finished;
        counters.failed = snapshot.requests_failed;
        counters.retried = snapshot.requests_retried;
        drop(counters);

        if let Some(encoded) = &snapshot.latency_finished_histogram_b64 {
            if let Some(h) = decode_histogram(encoded) {
                *self.latency_finished_ms.lock() = h;
            }
        }
        if let Some(encoded) = &snapshot.latency_failed_histogram_b64 {
            if let Some(h) = decode_histogram(encoded) {
                *self.latency_failed_ms.lock() = h;
            }
        }

        *self.retry_histogram.lock() = snapshot.retry_histogram;
        *self.status_codes.lock() = snapshot.status_codes.into_iter().collect();
        *self.final_errors.lock() = snapshot.final_errors.into_iter().collect();
        *self.retry_errors.lock() = snapshot.retry_errors.into_iter().collect();
        *self.started_at.lock() = snapshot
            .started_at_epoch_ms
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms));
        *self.finished_at.lock() = snapshot
            .finished_at_epoch_ms
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms));
    }
}
