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

//! A concurrency pool that scales its own parallelism between a min and max bound based on
//! sampled CPU, memory, and scheduler-lag health, with an optional hard rate cap.

mod concurrency;
mod pool;
mod rate_limiter;
mod resource;

pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
pub use pool::{AutoscaledPool, AutoscaledPoolOptions, PoolTasks};
pub use rate_limiter::RateLimiter;
pub use resource::{ResourceSample, ResourceSampler, SystemResourceSampler};
