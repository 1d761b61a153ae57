// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Resource-overload sampling: CPU, memory, and scheduler lag.
//!
//! Rust has no event loop to measure the way a single-threaded JS runtime does, so the "event
//! loop lag" signal is approximated by how late a `tokio::time::interval` tick fires relative to
//! its schedule: a healthy, unsaturated thread pool fires within a millisecond or two of the
//! scheduled instant, and a thread pool with all workers busy falls behind.

use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, Default)]
pub struct ResourceSample {
    pub cpu_overloaded: bool,
    pub memory_overloaded: bool,
    pub event_loop_overloaded: bool,
}

impl ResourceSample {
    pub fn is_overloaded(&self) -> bool {
        self.cpu_overloaded || self.memory_overloaded || self.event_loop_overloaded
    }
}

pub trait ResourceSampler: Send + Sync + 'static {
    fn sample(&self) -> ResourceSample;
}

/// Reads cgroup v2 (`/sys/fs/cgroup/cpu.stat`, `memory.current`/`memory.max`) or v1
/// (`.../cpu,cpuacct/cpuacct.usage`, `.../memory/memory.usage_in_bytes`+`memory.limit_in_bytes`)
/// accounting files when present, and falls back to whole-machine `sysinfo` stats otherwise (e.g.
/// inside a container runtime that doesn't mount cgroupfs, or on a non-Linux host).
pub struct SystemResourceSampler {
    cpu_threshold: f64,
    memory_threshold: f64,
    /// Fraction of `tick_interval` a tick may run late by before it counts as overloaded.
    event_loop_lag_ratio: f64,
    cgroup: Option<CgroupPaths>,
    sys: Mutex<sysinfo::System>,
    last_cpu_sample: Mutex<Option<(Instant, u64)>>,
    last_tick: Mutex<Instant>,
    tick_interval: Duration,
}

enum CgroupVersion {
    V2,
    V1,
}

struct CgroupPaths {
    version: CgroupVersion,
    cpu_usage: std::path::PathBuf,
    memory_usage: std::path::PathBuf,
    memory_limit: std::path::PathBuf,
}

fn detect_cgroup() -> Option<CgroupPaths> {
    let v2_cpu = Path::new("/sys/fs/cgroup/cpu.stat");
    let v2_mem = Path::new("/sys/fs/cgroup/memory.current");
    if v2_cpu.exists() && v2_mem.exists() {
        return Some(CgroupPaths {
            version: CgroupVersion::V2,
            cpu_usage: v2_cpu.to_path_buf(),
            memory_usage: v2_mem.to_path_buf(),
            memory_limit: Path::new("/sys/fs/cgroup/memory.max").to_path_buf(),
        });
    }

    let v1_cpu = Path::new("/sys/fs/cgroup/cpuacct/cpuacct.usage");
    let v1_mem = Path::new("/sys/fs/cgroup/memory/memory.usage_in_bytes");
    if v1_cpu.exists() && v1_mem.exists() {
        return Some(CgroupPaths {
            version: CgroupVersion::V1,
            cpu_usage: v1_cpu.to_path_buf(),
            memory_usage: v1_mem.to_path_buf(),
            memory_limit: Path::new("/sys/fs/cgroup/memory/memory.limit_in_bytes").to_path_buf(),
        });
    }

    None
}

fn read_u64(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// `cpu.stat`'s `usage_usec` line, in nanoseconds, to match v1's plain nanosecond counter.
fn read_cgroup_v2_cpu_usage_ns(path: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(usec) = line.strip_prefix("usage_usec ") {
            return usec.trim().parse::<u64>().ok().map(|usec| usec * 1000);
        }
    }
    None
}

impl SystemResourceSampler {
    pub fn new(cpu_threshold: f64, memory_threshold: f64, event_loop_lag_ratio: f64, tick_interval: Duration) -> Self {
        Self {
            cpu_threshold,
            memory_threshold,
            event_loop_lag_ratio,
            cgroup: detect_cgroup(),
            sys: Mutex::new(sysinfo::System::new()),
            last_cpu_sample: Mutex::new(None),
            last_tick: Mutex::new(Instant::now()),
            tick_interval,
        }
    }

    /// Called once per scaling-loop tick; records how late this call landed relative to the
    /// expected tick interval, used as the event-loop-lag proxy on the next `sample()`.
    pub fn record_tick(&self) {
        *self.last_tick.lock() = Instant::now();
    }

    fn cpu_overloaded(&self) -> bool {
        if let Some(cgroup) = &self.cgroup {
            let usage_ns = match cgroup.version {
                CgroupVersion::V2 => read_cgroup_v2_cpu_usage_ns(&cgroup.cpu_usage),
                CgroupVersion::V1 => read_u64(&cgroup.cpu_usage),
            };
            if let Some(usage_ns) = usage_ns {
                let now = Instant::now();
                let mut last = self.last_cpu_sample.lock();
                let overloaded = if let Some((last_time, last_usage_ns)) = *last {
                    let elapsed = now.duration_since(last_time).as_nanos() as f64;
                    let delta_ns = usage_ns.saturating_sub(last_usage_ns) as f64;
                    elapsed > 0.0 && (delta_ns / elapsed) > self.cpu_threshold
                } else {
                    false
                };
                *last = Some((now, usage_ns));
                return overloaded;
            }
        }

        let mut sys = self.sys.lock();
        sys.refresh_cpu_usage();
        sys.global_cpu_usage() as f64 / 100.0 > self.cpu_threshold
    }

    fn memory_overloaded(&self) -> bool {
        if let Some(cgroup) = &self.cgroup {
            if let (Some(usage), Some(limit)) = (
                read_u64(&cgroup.memory_usage),
                read_u64(&cgroup.memory_limit),
            ) {
                if limit > 0 {
                    return (usage as f64 / limit as f64) > self.memory_threshold;
                }
            }
        }

        let mut sys = self.sys.lock();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return false;
        }
        (sys.used_memory() as f64 / total as f64) > self.memory_threshold
    }

    fn event_loop_overloaded(&self) -> bool {
        let last_tick = *self.last_tick.lock();
        let lag = Instant::now().saturating_duration_since(last_tick);
        let overshoot = lag.saturating_sub(self.tick_interval);
        overshoot.as_secs_f64() > self.tick_interval.as_secs_f64() * self.event_loop_lag_ratio
    }
}

impl ResourceSampler for SystemResourceSampler {
    fn sample(&self) -> ResourceSample {
        ResourceSample {
            cpu_overloaded: self.cpu_overloaded(),
            memory_overloaded: self.memory_overloaded(),
            event_loop_overloaded: self.event_loop_overloaded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_does_not_panic_without_cgroup_files() {
        let sampler = SystemResourceSampler::new(0.4, 0.4, 0.5, Duration::from_secs(1));
        let sample = sampler.sample();
        // On a freshly constructed sampler with a recent record_tick default, nothing should read
        // as overloaded.
        assert!(!sample.event_loop_overloaded);
    }
}
