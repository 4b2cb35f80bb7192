//! Read-only views: statistics, health and integrity reports.
//!
//! [`StatsRecorder`] accumulates per-instance counters on the hot path with
//! relaxed atomics; the view types are plain serializable snapshots.

use crate::SequenceRequest;
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the only numbering strategy this engine implements.
pub const STRATEGY: &str = "global-sequential";

/// Snapshot returned by [`Coordinator::stats`](crate::Coordinator::stats).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStats {
    pub current_counter: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_generated: u64,
    pub total_recovered: u64,
    pub total_released: u64,
    pub available_gaps: usize,
    pub next_available_gap: Option<u64>,
    pub average_latency_ms: f64,
    pub peak_latency_ms: f64,
    pub site_distribution: BTreeMap<String, u64>,
    pub partition_distribution: BTreeMap<String, u64>,
    pub invoice_type_distribution: BTreeMap<String, u64>,
    pub site_partition_distribution: BTreeMap<String, u64>,
    /// Share of handed-out numbers that were reused gaps, in percent.
    pub gap_recovery_rate: f64,
    /// Whether the counter was read from the store for this snapshot.
    pub healthy: bool,
    pub strategy: String,
    pub node_id: String,
    pub instance_name: String,
    pub last_allocation_millis: Option<u64>,
    pub started_at_millis: u64,
}

/// Result of [`Coordinator::health`](crate::Coordinator::health).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub node_id: String,
    /// The last store round-trip of this instance succeeded.
    pub healthy: bool,
    /// Heartbeats could be listed and at least one node is live.
    pub cluster_healthy: bool,
    /// Nodes whose heartbeat is younger than the configured TTL.
    pub live_nodes: Vec<String>,
    pub last_success_millis: u64,
}

/// Result of [`Coordinator::validate_integrity`](crate::Coordinator::validate_integrity).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub counter: u64,
    /// Numbers currently in the gap pool, ascending.
    pub gaps: Vec<u64>,
    /// Numbers handed out twice without an intervening release.
    pub duplicates: Vec<u64>,
    /// Numbers both active and in the gap pool.
    pub overlapping: Vec<u64>,
    /// Numbers up to the counter with no audit record and no gap entry.
    pub unaccounted: Vec<u64>,
    /// Highest number invalidated by the latest reset, if any.
    pub invalidated_through: Option<u64>,
    pub summary: String,
}

/// Counters behind [`SequenceStats`].
#[derive(Default)]
pub struct StatsRecorder {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_generated: AtomicU64,
    total_recovered: AtomicU64,
    total_released: AtomicU64,
    latency_total_micros: AtomicU64,
    latency_samples: AtomicU64,
    latency_peak_micros: AtomicU64,
    last_allocation_millis: AtomicU64,
    distributions: Mutex<Distributions>,
}

#[derive(Clone, Default)]
struct Distributions {
    site: BTreeMap<String, u64>,
    partition: BTreeMap<String, u64>,
    invoice_type: BTreeMap<String, u64>,
    site_partition: BTreeMap<String, u64>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful allocation of `generated + recovered` numbers.
    pub fn record_allocation(
        &self,
        request: &SequenceRequest,
        generated: u64,
        recovered: u64,
        elapsed: Duration,
        now_millis: u64,
    ) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.count_numbers(request, generated, recovered);
        self.observe_latency(elapsed);
        self.last_allocation_millis
            .fetch_max(now_millis, Ordering::Relaxed);
    }

    /// Records a failed allocation. Numbers handed out before the failure
    /// still count towards the totals.
    pub fn record_failure(&self, request: &SequenceRequest, generated: u64, recovered: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.count_numbers(request, generated, recovered);
    }

    pub fn record_release(&self) {
        self.total_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Clears every counter and distribution.
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.failed_requests,
            &self.total_generated,
            &self.total_recovered,
            &self.total_released,
            &self.latency_total_micros,
            &self.latency_samples,
            &self.latency_peak_micros,
            &self.last_allocation_millis,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.distributions.lock() = Distributions::default();
    }

    /// Fills the recorder-owned fields of a [`SequenceStats`].
    pub(crate) fn fill(&self, stats: &mut SequenceStats) {
        stats.total_requests = self.total_requests.load(Ordering::Relaxed);
        stats.failed_requests = self.failed_requests.load(Ordering::Relaxed);
        stats.total_generated = self.total_generated.load(Ordering::Relaxed);
        stats.total_recovered = self.total_recovered.load(Ordering::Relaxed);
        stats.total_released = self.total_released.load(Ordering::Relaxed);

        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total = self.latency_total_micros.load(Ordering::Relaxed);
        stats.average_latency_ms = if samples == 0 {
            0.0
        } else {
            total as f64 / samples as f64 / 1_000.0
        };
        stats.peak_latency_ms = self.latency_peak_micros.load(Ordering::Relaxed) as f64 / 1_000.0;

        let handed_out = stats.total_generated + stats.total_recovered;
        stats.gap_recovery_rate = if handed_out == 0 {
            0.0
        } else {
            stats.total_recovered as f64 * 100.0 / handed_out as f64
        };

        let last = self.last_allocation_millis.load(Ordering::Relaxed);
        stats.last_allocation_millis = (last > 0).then_some(last);

        let distributions = self.distributions.lock().clone();
        stats.site_distribution = distributions.site;
        stats.partition_distribution = distributions.partition;
        stats.invoice_type_distribution = distributions.invoice_type;
        stats.site_partition_distribution = distributions.site_partition;
    }

    fn count_numbers(&self, request: &SequenceRequest, generated: u64, recovered: u64) {
        self.total_generated.fetch_add(generated, Ordering::Relaxed);
        self.total_recovered.fetch_add(recovered, Ordering::Relaxed);
        let n = generated + recovered;
        if n == 0 {
            return;
        }
        let mut d = self.distributions.lock();
        *d.site.entry(request.site_id.clone()).or_default() += n;
        *d.partition.entry(request.partition_id.clone()).or_default() += n;
        *d.invoice_type
            .entry(request.invoice_type.clone())
            .or_default() += n;
        *d.site_partition
            .entry(format!("{}:{}", request.site_id, request.partition_id))
            .or_default() += n;
    }

    fn observe_latency(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.latency_total_micros
            .fetch_add(micros, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.latency_peak_micros
            .fetch_max(micros, Ordering::Relaxed);
    }
}
