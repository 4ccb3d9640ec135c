//! Per-service call statistics.
//!
//! One [`ProcessRecord`] per [`ServiceIdentity`], created on the first call
//! and kept for the container's lifetime. Updates take the record's own
//! mutex, so calls to different services never serialize on a shared lock;
//! the `DashMap` shard lock is held only long enough to fetch or insert the
//! record handle.
//!
//! Each update is also mirrored to the `metrics` facade
//! (`soa_calls_total`, `soa_call_duration_ms`), which is a no-op unless the
//! host installs a recorder.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use soa_core::ServiceIdentity;

/// Outcome of a single call as seen by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSample {
    pub elapsed_ms: u64,
    pub succeeded: bool,
    pub request_bytes: u64,
    pub response_bytes: u64,
}

/// Aggregated counters for one service identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub total_latency_ms: u64,
    pub succeeded_calls: u64,
    pub failed_calls: u64,
    pub total_calls: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
}

impl ProcessRecord {
    /// Folds one call into the record.
    ///
    /// The first call seeds min and max with its own latency, so a zero
    /// floor never hides the real minimum.
    pub fn apply(&mut self, sample: &CallSample) {
        let first = self.total_calls == 0;
        if first || sample.elapsed_ms < self.min_latency_ms {
            self.min_latency_ms = sample.elapsed_ms;
        }
        if first || sample.elapsed_ms > self.max_latency_ms {
            self.max_latency_ms = sample.elapsed_ms;
        }
        self.total_latency_ms = self.total_latency_ms.saturating_add(sample.elapsed_ms);

        if sample.succeeded {
            self.succeeded_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        self.total_calls += 1;

        self.request_bytes = self.request_bytes.saturating_add(sample.request_bytes);
        self.response_bytes = self.response_bytes.saturating_add(sample.response_bytes);
    }

    /// Mean latency, or 0 before the first call.
    #[must_use]
    pub fn average_latency_ms(&self) -> u64 {
        self.total_latency_ms.checked_div(self.total_calls).unwrap_or(0)
    }
}

/// Concurrent table of per-service records.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    records: DashMap<ServiceIdentity, Arc<Mutex<ProcessRecord>>>,
}

impl MetricsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one call to the record of `identity`, creating it if needed.
    pub fn update(&self, identity: &ServiceIdentity, sample: CallSample) {
        let record = self.record(identity);
        let snapshot = {
            let mut guard = record.lock();
            guard.apply(&sample);
            *guard
        };
        debug_assert_eq!(
            snapshot.total_calls,
            snapshot.succeeded_calls + snapshot.failed_calls
        );

        let outcome = if sample.succeeded { "success" } else { "failure" };
        ::metrics::counter!(
            "soa_calls_total",
            "service" => identity.service_name.clone(),
            "method" => identity.method_name.clone(),
            "version" => identity.version_name.clone(),
            "outcome" => outcome
        )
        .increment(1);
        #[allow(clippy::cast_precision_loss)]
        ::metrics::histogram!(
            "soa_call_duration_ms",
            "service" => identity.service_name.clone(),
            "method" => identity.method_name.clone(),
            "version" => identity.version_name.clone()
        )
        .record(sample.elapsed_ms as f64);
    }

    fn record(&self, identity: &ServiceIdentity) -> Arc<Mutex<ProcessRecord>> {
        if let Some(existing) = self.records.get(identity) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.records.entry(identity.clone()).or_default().value())
    }

    /// Current value of one record.
    #[must_use]
    pub fn get(&self, identity: &ServiceIdentity) -> Option<ProcessRecord> {
        self.records.get(identity).map(|entry| *entry.value().lock())
    }

    /// Copies every record, sorted by identity.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ServiceIdentity, ProcessRecord)> {
        let mut out: Vec<_> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value().lock()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Copies every record that saw calls and resets it for the next period.
    /// Records themselves stay in the table.
    #[must_use]
    pub fn take_snapshot(&self) -> Vec<(ServiceIdentity, ProcessRecord)> {
        let mut out: Vec<_> = self
            .records
            .iter()
            .filter_map(|entry| {
                let taken = std::mem::take(&mut *entry.value().lock());
                (taken.total_calls > 0).then(|| (entry.key().clone(), taken))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Number of distinct identities seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
