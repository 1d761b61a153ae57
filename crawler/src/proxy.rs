// Copyright 2024 Crawlee Rust Core Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Tiered proxy selection: an ordered list of tiers, each a pool of URLs, with per-host tier
//! escalation driven by an exponentially-decayed error counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fnv::FnvHashMap as HashMap;
use parking_lot::Mutex;

/// One tier: a named set of proxy URLs, escalated to when lower tiers look unhealthy for a host.
pub struct ProxyTier {
    pub urls: Vec<String>,
    next: AtomicUsize,
}

impl ProxyTier {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            next: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> Option<&str> {
        if self.urls.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.urls.len();
        Some(self.urls[index].as_str())
    }
}

struct HostState {
    decayed_errors: f64,
    last_update: Instant,
}

/// Tuning for how quickly a host's error counter decays back down, and the thresholds that drive
/// tier escalation/de-escalation. The exact constants are left to the implementation; the only
/// hard requirement is that escalation is monotone in the error rate.
#[derive(Clone, Copy, Debug)]
pub struct ProxyTierOptions {
    /// Error-counter half-life: after this much time with no new errors, the counter halves.
    pub decay_half_life: Duration,
    /// Counter value at or above which a host escalates to the next tier.
    pub escalate_threshold: f64,
    /// Counter value at or below which a host may drift back down to a lower tier.
    pub de_escalate_threshold: f64,
}

impl Default for ProxyTierOptions {
    fn default() -> Self {
        Self {
            decay_half_life: Duration::from_secs(60),
            escalate_threshold: 3.0,
            de_escalate_threshold: 0.5,
        }
    }
}

/// Selects a proxy URL per `(session, request)` tuple, escalating a destination host to a higher
/// tier on repeated errors and letting it drift back down as the decayed error counter decays.
pub struct TieredProxyProvider {
    tiers: Vec<ProxyTier>,
    options: ProxyTierOptions,
    hosts: Mutex<HashMap<String, (usize, HostState)>>,
}

impl TieredProxyProvider {
    pub fn new(tiers: Vec<Vec<String>>, options: ProxyTierOptions) -> Self {
        Self {
            tiers: tiers.into_iter().map(ProxyTier::new).collect(),
            options,
            hosts: Mutex::new(HashMap::default()),
        }
    }

    fn decayed(&self, state: &HostState) -> f64 {
        let elapsed = state.last_update.elapsed().as_secs_f64();
        let half_life = self.options.decay_half_life.as_secs_f64().max(f64::EPSILON);
        state.decayed_errors * 0.5_f64.powf(elapsed / half_life)
    }

    /// Returns the currently selected proxy URL for `host`, round-robin within its current tier.
    pub fn select(&self, host: &str) -> Option<&str> {
        let hosts = self.hosts.lock();
        let tier_index = hosts.get(host).map_or(0, |(tier, _)| *tier);
        drop(hosts);
        let tier_index = tier_index.min(self.tiers.len().saturating_sub(1));
        self.tiers.get(tier_index)?.pick()
    }

    /// Records an error against `host`, escalating its tier if the decayed counter crosses the
    /// escalation threshold.
    pub fn record_error(&self, host: &str) {
        let mut hosts = self.hosts.lock();
        let entry = hosts.entry(host.to_string()).or_insert_with(|| {
            (
                0,
                HostState {
                    decayed_errors: 0.0,
                    last_update: Instant::now(),
                },
            )
        });
        let decayed = self.decayed(&entry.1) + 1.0;
        entry.1.decayed_errors = decayed;
        entry.1.last_update = Instant::now();
        if decayed >= self.options.escalate_threshold && entry.0 + 1 < self.tiers.len() {
            entry.0 += 1;
        }
    }

    /// Records a success against `host`, letting its decayed counter (and possibly its tier) drift
    /// back down.
    pub fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.lock();
        let Some(entry) = hosts.get_mut(host) else {
            return;
        };
        let decayed = self.decayed(&entry.1);
        entry.1.decayed_errors = decayed;
        entry.1.last_update = Instant::now();
        if decayed <= self.options.de_escalate_threshold && entry.0 > 0 {
            entry.0 -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_errors_escalate_the_tier() {
        let provider = TieredProxyProvider::new(
            vec![vec!["tier0".to_string()], vec!["tier1".to_string()]],
            ProxyTierOptions {
                decay_half_life: Duration::from_secs(3600),
                escalate_threshold: 2.0,
                de_escalate_threshold: 0.5,
            },
        );
        assert_eq!(provider.select("host"), Some("tier0"));
        provider.record_error("host");
        provider.record_error("host");
        assert_eq!(provider.select("host"), Some("tier1"));
    }

    #[test]
    fn escalation_never_exceeds_the_highest_tier() {
        let provider = TieredProxyProvider::new(
            vec![vec!["tier0".to_string()]],
            ProxyTierOptions {
                decay_half_life: Duration::from_secs(3600),
                escalate_threshold: 1.0,
                de_escalate_threshold: 0.1,
            },
        );
        for _ in 0..10 {
            provider.record_error("host");
        }
        assert_eq!(provider.select("host"), Some("tier0"));
    }
}
