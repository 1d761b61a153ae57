// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A simple fixed-window rate cap for the optional `max_tasks_per_minute` setting.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Window {
    started_at: Instant,
    count: u32,
}

pub struct RateLimiter {
    max_per_minute: u32,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            window: Mutex::new(Window {
                started_at: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Blocks until a slot within the current one-minute window is available, then consumes it.
    pub async fn throttle(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock();
                let elapsed = window.started_at.elapsed();
                if elapsed >= Duration::from_secs(60) {
                    window.started_at = Instant::now();
                    window.count = 0;
                }
                if window.count < self.max_per_minute {
                    window.count += 1;
                    None
                } else {
                    Some(Duration::from_secs(60) - elapsed)
                }
            };
            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn caps_throughput_to_configured_rate() {
        let limiter = RateLimiter::new(2);
        limiter.throttle().await;
        limiter.throttle().await;

        let start = Instant::now();
        limiter.throttle().await;
        assert!(start.elapsed() >= Duration::from_secs(59));
    }
}
