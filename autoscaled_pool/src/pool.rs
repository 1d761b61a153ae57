// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The scaling control loop itself: pulls ready tasks, runs them under a `ConcurrencyLimiter`, and
//! periodically adjusts that limiter's target based on sampled resource health.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use task_executor::{Executor, TailTasks};

use crate::concurrency::ConcurrencyLimiter;
use crate::rate_limiter::RateLimiter;
use crate::resource::{ResourceSampler, SystemResourceSampler};

/// The source of work an `AutoscaledPool` drains. Implemented by `crawler` over its combined
/// request-list/request-queue view.
#[async_trait]
pub trait PoolTasks: Send + Sync + 'static {
    /// Whether a task is ready to run right now. Lets the pool avoid busy-looping while the
    /// upstream source is temporarily dry but not yet finished.
    async fn is_task_ready(&self) -> bool;
    /// Runs a single ready task to completion.
    async fn run_task(&self);
    /// Whether the task source is exhausted and no further tasks will ever become ready.
    async fn is_finished(&self) -> bool;
    /// Fraction of recently completed tasks that failed with a runtime-classified overload error
    /// (e.g. a self-imposed timeout). Sources with nothing to report return 0.0.
    async fn client_error_ratio(&self) -> f64 {
        0.0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AutoscaledPoolOptions {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub desired_concurrency: usize,
    pub max_tasks_per_minute: Option<u32>,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Fraction of recent samples that must be overloaded to trigger a scale-down.
    pub overload_ratio_threshold: f64,
    /// CPU usage fraction above which a single sample counts as overloaded.
    pub cpu_overload_threshold: f64,
    /// Memory usage fraction above which a single sample counts as overloaded.
    pub memory_overload_threshold: f64,
    /// Fraction of `scaling_interval` a tick may run late by before a sample counts as
    /// event-loop-overloaded.
    pub event_loop_lag_ratio_threshold: f64,
    /// Client-error ratio above which a sample counts as overloaded; any non-zero ratio trips it
    /// at the default of 0.0.
    pub client_error_ratio_threshold: f64,
    pub scaling_interval: Duration,
    pub shutdown_drain_timeout: Duration,
}

impl Default for AutoscaledPoolOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: 10,
            max_tasks_per_minute: None,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            overload_ratio_threshold: 0.3,
            cpu_overload_threshold: 0.4,
            memory_overload_threshold: 0.4,
            event_loop_lag_ratio_threshold: 0.5,
            client_error_ratio_threshold: 0.0,
            scaling_interval: Duration::from_secs(10),
            shutdown_drain_timeout: Duration::from_secs(30),
        }
    }
}

pub struct AutoscaledPool<T> {
    tasks: Arc<T>,
    limiter: ConcurrencyLimiter,
    rate_limiter: Option<RateLimiter>,
    sampler: Arc<dyn ResourceSampler>,
    options: AutoscaledPoolOptions,
    samples: parking_lot::Mutex<Vec<bool>>,
    abort: Arc<AtomicBool>,
}

impl<T: PoolTasks> AutoscaledPool<T> {
    pub fn new(tasks: Arc<T>, options: AutoscaledPoolOptions) -> Self {
        Self::with_sampler(
            tasks,
            options,
            Arc::new(SystemResourceSampler::new(
                options.cpu_overload_threshold,
                options.memory_overload_threshold,
                options.event_loop_lag_ratio_threshold,
                options.scaling_interval,
            )),
        )
    }

    pub fn with_sampler(
        tasks: Arc<T>,
        options: AutoscaledPoolOptions,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Self {
        Self {
            tasks,
            limiter: ConcurrencyLimiter::new(options.desired_concurrency.max(options.min_concurrency)),
            rate_limiter: options.max_tasks_per_minute.map(RateLimiter::new),
            sampler,
            options,
            samples: parking_lot::Mutex::new(Vec::new()),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Requests that the pool wind down: no new tasks are started, and `run` returns once
    /// in-flight ones drain (up to `shutdown_drain_timeout`).
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// The concurrency ceiling the limiter is currently enforcing.
    pub fn desired_concurrency(&self) -> usize {
        self.limiter.target()
    }

    /// How many tasks are in flight right now.
    pub fn in_flight(&self) -> usize {
        self.limiter.in_use()
    }

    /// Runs the pool to completion: drives tasks until the source reports finished (or `abort` is
    /// called), scaling concurrency up and down on `scaling_interval` in the background.
    pub async fn run(self: Arc<Self>, executor: &Executor) {
        let tail = TailTasks::new();
        let handle = executor.handle().clone();

        let scaling_handle = {
            let this = self.clone();
            executor.native_spawn(async move { this.scaling_loop().await })
        };

        loop {
            if self.is_aborted() || self.tasks.is_finished().await {
                break;
            }
            if !self.tasks.is_task_ready().await {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            if let Some(rate_limiter) = &self.rate_limiter {
                rate_limiter.throttle().await;
            }

            let permit = self.limiter.acquire().await;
            let tasks = self.tasks.clone();
            tail.spawn_on("autoscaled-pool-task", &handle, async move {
                tasks.run_task().await;
                drop(permit);
            });
        }

        scaling_handle.abort();
        tail.wait(self.options.shutdown_drain_timeout).await;
    }

    async fn scaling_loop(self: Arc<Self>) {
        /// In-flight occupancy, as a fraction of the current target, that counts as "near
        /// saturation" for the scale-up decision.
        const SATURATION_RATIO: f64 = 0.9;

        let mut ticker = tokio::time::interval(self.options.scaling_interval);
        loop {
            ticker.tick().await;
            let sample = self.sampler.sample();
            let client_error_ratio = self.tasks.client_error_ratio().await;
            let tick_overloaded =
                sample.is_overloaded() || client_error_ratio > self.options.client_error_ratio_threshold;

            let mut samples = self.samples.lock();
            samples.push(tick_overloaded);
            if samples.len() > 5 {
                samples.remove(0);
            }
            let overloaded_ratio = samples.iter().filter(|s| **s).count() as f64 / samples.len() as f64;
            drop(samples);

            let current = self.limiter.target();
            if overloaded_ratio >= self.options.overload_ratio_threshold {
                let reduced = (current as f64 * (1.0 - self.options.scale_down_step_ratio)) as usize;
                let new_target = reduced.max(self.options.min_concurrency);
                if new_target < current {
                    log::debug!("scaling down from {current} to {new_target} (overload ratio {overloaded_ratio:.2})");
                    self.limiter.set_target(new_target);
                }
            } else if overloaded_ratio == 0.0 {
                let saturated = self.limiter.in_use() as f64 >= current as f64 * SATURATION_RATIO;
                if saturated {
                    let increased = (current as f64 * (1.0 + self.options.scale_up_step_ratio)).ceil() as usize;
                    let new_target = increased.min(self.options.max_concurrency).max(current + 1).min(self.options.max_concurrency);
                    if new_target > current {
                        log::debug!("scaling up from {current} to {new_target} (in-flight {} near saturation)", self.limiter.in_use());
                        self.limiter.set_target(new_target);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingTasks {
        remaining: AtomicUsize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl PoolTasks for CountingTasks {
        // Claims a unit of work atomically, so concurrent callers can't both see "ready" for the
        // same last item.
        async fn is_task_ready(&self) -> bool {
            loop {
                let current = self.remaining.load(Ordering::Relaxed);
                if current == 0 {
                    return false;
                }
                if self
                    .remaining
                    .compare_exchange(current, current - 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
            }
        }

        async fn run_task(&self) {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }

        async fn is_finished(&self) -> bool {
            self.remaining.load(Ordering::Relaxed) == 0
        }
    }

    #[tokio::test]
    async fn drains_all_ready_tasks() {
        let executor = task_executor::Executor::new();
        let tasks = Arc::new(CountingTasks {
            remaining: AtomicUsize::new(5),
            completed: AtomicUsize::new(0),
        });
        let pool = Arc::new(AutoscaledPool::new(
            tasks.clone(),
            AutoscaledPoolOptions {
                scaling_interval: Duration::from_secs(3600),
                ..AutoscaledPoolOptions::default()
            },
        ));
        pool.run(&executor).await;
        assert_eq!(tasks.completed.load(Ordering::Relaxed), 5);
    }

    struct NeverOverloadedSampler;

    impl ResourceSampler for NeverOverloadedSampler {
        fn sample(&self) -> crate::resource::ResourceSample {
            crate::resource::ResourceSample::default()
        }
    }

    struct IdleTasks;

    #[async_trait]
    impl PoolTasks for IdleTasks {
        async fn is_task_ready(&self) -> bool {
            false
        }
        async fn run_task(&self) {}
        async fn is_finished(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scale_up_does_not_fire_without_saturation() {
        let pool = Arc::new(AutoscaledPool::with_sampler(
            Arc::new(IdleTasks),
            AutoscaledPoolOptions {
                min_concurrency: 1,
                max_concurrency: 10,
                desired_concurrency: 4,
                scaling_interval: Duration::from_secs(1),
                ..AutoscaledPoolOptions::default()
            },
            Arc::new(NeverOverloadedSampler),
        ));

        let scaling = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.scaling_loop().await })
        };

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.desired_concurrency(), 4, "nothing in flight is not near saturation");
        scaling.abort();
    }

    struct StickyTask {
        spawned: AtomicBool,
    }

    #[async_trait]
    impl PoolTasks for StickyTask {
        async fn is_task_ready(&self) -> bool {
            !self.spawned.swap(true, Ordering::Relaxed)
        }
        async fn run_task(&self) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        async fn is_finished(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scale_up_fires_once_in_flight_count_saturates_the_target() {
        let tasks = Arc::new(StickyTask {
            spawned: AtomicBool::new(false),
        });
        let pool = Arc::new(AutoscaledPool::with_sampler(
            tasks,
            AutoscaledPoolOptions {
                min_concurrency: 1,
                max_concurrency: 4,
                desired_concurrency: 1,
                scale_up_step_ratio: 1.0,
                scaling_interval: Duration::from_secs(1),
                ..AutoscaledPoolOptions::default()
            },
            Arc::new(NeverOverloadedSampler),
        ));

        let pool_clone = pool.clone();
        tokio::spawn(async move {
            let executor = task_executor::Executor::new();
            pool_clone.run(&executor).await
        });

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(pool.in_flight(), 1, "the lone sticky task should have claimed the only permit");

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(
            pool.desired_concurrency(),
            2,
            "in-flight at 100% of target for the full window should trigger a scale-up"
        );
    }
}
