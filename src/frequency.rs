//! Frequency tracker — the degrade-on-error wrapper around
//! [`crate::kv::FrequencyStore`].
//!
//! `record_and_query` must never fail the containing analysis: a store
//! error is logged, increments `redis_errors_frequency`, and is turned into
//! an all-zero [`FrequencyRecord`], per SPEC_FULL.md §4.4 and §7.

use crate::kv::FrequencyStore;
use crate::metrics::Metrics;
use crate::model::FrequencyRecord;

pub struct FrequencyTracker {
    store: FrequencyStore,
}

impl FrequencyTracker {
    pub fn new(store: FrequencyStore) -> Self {
        Self { store }
    }

    pub async fn record_and_query(
        &self,
        source: &str,
        now_unix: f64,
        metrics: &Metrics,
    ) -> FrequencyRecord {
        match self.store.record_and_query(source, now_unix).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, source, "frequency tracker degraded to zero");
                metrics.incr(&format!("redis_errors_frequency_{}", e.kind()));
                FrequencyRecord::default()
            }
        }
    }
}
