// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The caller-facing configuration surface for a crawl.

use std::time::Duration;

use autoscaled_pool::AutoscaledPoolOptions;
use serde::{Deserialize, Serialize};
use session_pool::SessionPoolOptions;

use crate::error::CrawlerError;

/// All tunables a caller can set before starting a crawl. Every field has a default matching the
/// behavior a crawl gets if the caller sets nothing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub max_concurrency: usize,
    pub min_concurrency: usize,
    pub max_requests_per_minute: Option<u32>,
    pub max_request_retries: u32,
    pub max_requests_per_crawl: Option<u64>,
    pub request_handler_timeout_secs: u64,
    pub navigation_timeout_secs: u64,
    /// Keep running past an apparently-finished queue/list, waiting for new inserts, instead of
    /// stopping. `max_requests_per_crawl`, if set, is still a hard cap regardless of this flag.
    pub keep_alive: bool,
    pub use_session_pool: bool,
    pub persist_cookies_per_session: bool,
    pub session_pool_options: SessionPoolOptions,
    pub autoscaled_pool_options: AutoscaledPoolOptions,
    /// Status codes that retire the session that received them. Default `{401, 403, 429}`.
    pub blocked_status_codes: Vec<u16>,
    /// How often in-flight request-list/request-queue/session-pool/statistics state is
    /// checkpointed to the backing store.
    pub persistence_interval: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 200,
            min_concurrency: 1,
            max_requests_per_minute: None,
            max_request_retries: 3,
            max_requests_per_crawl: None,
            request_handler_timeout_secs: 60,
            navigation_timeout_secs: 60,
            keep_alive: false,
            use_session_pool: true,
            persist_cookies_per_session: true,
            session_pool_options: SessionPoolOptions::default(),
            autoscaled_pool_options: AutoscaledPoolOptions::default(),
            blocked_status_codes: vec![401, 403, 429],
            persistence_interval: Duration::from_secs(10),
        }
    }
}

impl CrawlerConfig {
    /// Checked at runtime construction time; a `ConfigurationError` here is synchronous and fatal,
    /// never something a crawl retries past.
    pub fn validate(&self) -> Result<(), CrawlerError> {
        if self.min_concurrency == 0 {
            return Err(CrawlerError::Configuration(
                "min_concurrency must be at least 1".to_string(),
            ));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(CrawlerError::Configuration(format!(
                "min_concurrency ({}) exceeds max_concurrency ({})",
                self.min_concurrency, self.max_concurrency
            )));
        }
        if let Some(cap) = self.max_requests_per_crawl {
            if cap == 0 {
                return Err(CrawlerError::Configuration(
                    "max_requests_per_crawl must be at least 1 when set".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn into_autoscaled_pool_options(self) -> AutoscaledPoolOptions {
        AutoscaledPoolOptions {
            min_concurrency: self.min_concurrency,
            max_concurrency: self.max_concurrency,
            max_tasks_per_minute: self.max_requests_per_minute,
            ..self.autoscaled_pool_options
        }
    }
}
