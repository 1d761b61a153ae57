// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The error surface handlers and the runtime itself report failures through.

use std::fmt;

use kvstore::KvError;

/// Failures a crawl run can hit, classified by what retries them and how.
#[derive(Debug)]
pub enum CrawlerError {
    /// The registered `requestHandler` (or a router-dispatched handler) returned an error.
    RequestHandler(String),
    /// The navigation strategy (performing the actual fetch/render) failed.
    Navigation(String),
    /// A navigation or handler exceeded its configured time budget.
    Timeout(String),
    /// The response matched a configured blocked-status-code or blocked-content pattern.
    Blocked(String),
    /// The request queue, request list, or session pool's backing store failed.
    QueueBackend(KvError),
    /// The supplied `CrawlerConfig` is internally inconsistent.
    Configuration(String),
    /// The run was stopped via `CrawlerRuntime::abort` before finishing.
    Cancelled,
}

impl fmt::Display for CrawlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestHandler(msg) => write!(f, "request handler failed: {msg}"),
            Self::Navigation(msg) => write!(f, "navigation failed: {msg}"),
            Self::Timeout(msg) => write!(f, "timed out: {msg}"),
            Self::Blocked(msg) => write!(f, "blocked: {msg}"),
            Self::QueueBackend(e) => write!(f, "queue backend error: {e}"),
            Self::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Cancelled => write!(f, "crawl was cancelled"),
        }
    }
}

impl std::error::Error for CrawlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::QueueBackend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KvError> for CrawlerError {
    fn from(e: KvError) -> Self {
        Self::QueueBackend(e)
    }
}

impl CrawlerError {
    /// The classification tag used by `crawler_stats::fingerprint` to bucket this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestHandler(_) => "request_handler",
            Self::Navigation(_) => "navigation",
            Self::Timeout(_) => "timeout",
            Self::Blocked(_) => "blocked",
            Self::QueueBackend(_) => "queue_backend",
            Self::Configuration(_) => "configuration",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this failure should ever be retried. `Blocked` is retried like any other
    /// error — the session behind it is retired separately, so the retry runs under a fresh
    /// identity rather than a resend of the same one. `Cancelled` and `Configuration` are not
    /// retried: a cancelled run should not schedule more work, and a configuration error will
    /// fail identically on every attempt.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Configuration(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_and_configuration_are_not_retriable_but_blocked_is() {
        assert!(!CrawlerError::Cancelled.is_retriable());
        assert!(!CrawlerError::Configuration("bad config".to_string()).is_retriable());
        assert!(CrawlerError::Blocked("captcha".to_string()).is_retriable());
        assert!(CrawlerError::Navigation("reset".to_string()).is_retriable());
    }
}
