//! In-process metrics counters.
//!
//! A flat name→count map, incremented from anywhere in the process and
//! snapshotted by the `/metrics` handler. Key names are free-form strings —
//! callers agree on them by convention, not by a closed enum, matching how
//! every call site in the upstream system just passes a literal string.
//!
//! The one name worth calling out: tarpit hits are always recorded under the
//! plain string `"tarpit_hits"` — the original constant this was ported from
//! carried a typo in its Rust-unfriendly identifier, not in the string value
//! it held, so there is nothing odd to preserve here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

pub struct Metrics {
    counters: DashMap<String, AtomicU64>,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: std::collections::BTreeMap<String, u64>,
    pub uptime_seconds: f64,
    /// UTC instant this snapshot was taken, per spec §4.1's
    /// `{name→value, uptime_seconds, last_updated}` contract.
    pub last_updated: DateTime<Utc>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Increment `key` by `delta`, creating it at zero first if unseen.
    pub fn increment(&self, key: &str, delta: u64) {
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn incr(&self, key: &str) {
        self.increment(key, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        MetricsSnapshot {
            counters,
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            last_updated: Utc::now(),
        }
    }

    #[cfg(test)]
    pub fn reset(&self) {
        self.counters.clear();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
