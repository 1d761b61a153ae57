// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

/// Errors surfaced by `KvStore`, `QueueBackend`, and `DatasetSink` implementations.
///
/// `request_queue` classifies `KvError::Backend` as transient (retried with its own backoff) and
/// everything else as a final, per-attempt failure.
#[derive(Debug, Clone)]
pub enum KvError {
    /// The caller is not (or is no longer) the lock holder.
    LockNotHeld { id: u64 },
    /// A request id referenced an entry that does not exist.
    NotFound { id: u64 },
    /// The backend rejected the operation for a reason that may clear up on retry (I/O error,
    /// timeout, serialization failure in transit).
    Backend(String),
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::LockNotHeld { id } => write!(f, "lock not held for request {id}"),
            KvError::NotFound { id } => write!(f, "no such request {id}"),
            KvError::Backend(msg) => write!(f, "backend error: {msg}"),
        }
    }
}

impl std::error::Error for KvError {}

impl KvError {
    /// Whether `request_queue`'s internal retry loop should retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Backend(_))
    }
}
