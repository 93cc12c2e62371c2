//! Process-wide metrics collection and Prometheus export
//!
//! A functional, lock-free collector: all series are atomics behind one
//! `Arc`, cloned freely into every component. The `/metrics` listener
//! renders the text format via [`MetricsCollector::export_prometheus`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache-level operations, used as the `operation` label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Get,
    Put,
    Contains,
    GetActionResult,
    UpdateActionResult,
    Delete,
    List,
}

impl CacheOp {
    const ALL: [CacheOp; 7] = [
        CacheOp::Get,
        CacheOp::Put,
        CacheOp::Contains,
        CacheOp::GetActionResult,
        CacheOp::UpdateActionResult,
        CacheOp::Delete,
        CacheOp::List,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Label value for this operation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CacheOp::Get => "get",
            CacheOp::Put => "put",
            CacheOp::Contains => "contains",
            CacheOp::GetActionResult => "get_action_result",
            CacheOp::UpdateActionResult => "update_action_result",
            CacheOp::Delete => "delete",
            CacheOp::List => "list",
        }
    }
}

/// RPC methods, used as the `method` label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Get,
    Put,
    Contains,
    GetActionResult,
    UpdateActionResult,
}

impl RpcMethod {
    const ALL: [RpcMethod; 5] = [
        RpcMethod::Get,
        RpcMethod::Put,
        RpcMethod::Contains,
        RpcMethod::GetActionResult,
        RpcMethod::UpdateActionResult,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Label value for this method
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RpcMethod::Get => "Get",
            RpcMethod::Put => "Put",
            RpcMethod::Contains => "Contains",
            RpcMethod::GetActionResult => "GetActionResult",
            RpcMethod::UpdateActionResult => "UpdateActionResult",
        }
    }
}

/// RPC outcomes, used as the `status` label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcOutcome {
    Success,
    InvalidRequest,
    NotFound,
    StreamError,
    StorageError,
}

impl RpcOutcome {
    const ALL: [RpcOutcome; 5] = [
        RpcOutcome::Success,
        RpcOutcome::InvalidRequest,
        RpcOutcome::NotFound,
        RpcOutcome::StreamError,
        RpcOutcome::StorageError,
    ];

    const fn index(self) -> usize {
        self as usize
    }

    /// Label value for this outcome
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RpcOutcome::Success => "success",
            RpcOutcome::InvalidRequest => "invalid_request",
            RpcOutcome::NotFound => "not_found",
            RpcOutcome::StreamError => "stream_error",
            RpcOutcome::StorageError => "storage_error",
        }
    }
}

/// Upper bounds in seconds for operation-duration histograms (1ms to ~16s)
const DURATION_BUCKETS: [f64; 15] = [
    0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096,
    8.192, 16.384,
];

/// Upper bounds in seconds for pruning-cycle histograms (1s to ~8.5m)
const PRUNING_BUCKETS: [f64; 10] = [1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0];

/// A fixed-bucket histogram with atomic counters
#[derive(Debug)]
struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: (0..bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        for (i, bound) in self.bounds.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Render the histogram series with the given name and label pairs
    fn render(&self, out: &mut String, name: &str, labels: &str) {
        let mut cumulative = 0u64;
        for (i, bound) in self.bounds.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            let sep = if labels.is_empty() { "" } else { "," };
            let _ = writeln!(
                out,
                "{name}_bucket{{{labels}{sep}le=\"{bound}\"}} {cumulative}"
            );
        }
        let count = self.count.load(Ordering::Relaxed);
        let sep = if labels.is_empty() { "" } else { "," };
        let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {count}");
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        if labels.is_empty() {
            let _ = writeln!(out, "{name}_sum {sum}");
            let _ = writeln!(out, "{name}_count {count}");
        } else {
            let _ = writeln!(out, "{name}_sum{{{labels}}} {sum}");
            let _ = writeln!(out, "{name}_count{{{labels}}} {count}");
        }
    }
}

/// Metrics collector shared across the cache service, pruner, and RPC layer
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    state: Arc<MetricsState>,
}

#[derive(Debug)]
struct MetricsState {
    // Cache data plane
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_writes: AtomicU64,
    cache_deletions: AtomicU64,
    cache_errors: [AtomicU64; 7],
    cache_op_duration: Vec<Histogram>,
    bytes_served: AtomicU64,
    bytes_stored: AtomicU64,

    // Published by the pruner; not authoritative between cycles
    cache_size_bytes: AtomicU64,

    // Pruning controller
    pruned_entries: AtomicU64,
    pruned_bytes: AtomicU64,
    pruning_errors: AtomicU64,
    pruning_cycles_noop: AtomicU64,
    pruning_cycles_pruned: AtomicU64,
    pruning_duration: Histogram,

    // RPC surface
    grpc_requests: [[AtomicU64; 5]; 5],
    grpc_duration: Vec<Histogram>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a new collector with all series at zero
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(MetricsState {
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                cache_writes: AtomicU64::new(0),
                cache_deletions: AtomicU64::new(0),
                cache_errors: Default::default(),
                cache_op_duration: (0..CacheOp::ALL.len())
                    .map(|_| Histogram::new(&DURATION_BUCKETS))
                    .collect(),
                bytes_served: AtomicU64::new(0),
                bytes_stored: AtomicU64::new(0),
                cache_size_bytes: AtomicU64::new(0),
                pruned_entries: AtomicU64::new(0),
                pruned_bytes: AtomicU64::new(0),
                pruning_errors: AtomicU64::new(0),
                pruning_cycles_noop: AtomicU64::new(0),
                pruning_cycles_pruned: AtomicU64::new(0),
                pruning_duration: Histogram::new(&PRUNING_BUCKETS),
                grpc_requests: Default::default(),
                grpc_duration: (0..RpcMethod::ALL.len())
                    .map(|_| Histogram::new(&DURATION_BUCKETS))
                    .collect(),
            }),
        }
    }

    /// Record a cache hit or miss
    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.state.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.state.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a completed cache write
    pub fn record_cache_write(&self) {
        self.state.cache_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed cache deletion
    pub fn record_cache_deletion(&self) {
        self.state.cache_deletions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed cache operation
    pub fn record_cache_error(&self, op: CacheOp) {
        self.state.cache_errors[op.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record the duration of a cache operation
    pub fn observe_cache_op(&self, op: CacheOp, duration: Duration) {
        self.state.cache_op_duration[op.index()].observe(duration);
    }

    /// Record bytes streamed out to clients
    pub fn add_bytes_served(&self, n: u64) {
        self.state.bytes_served.fetch_add(n, Ordering::Relaxed);
    }

    /// Record bytes accepted from clients
    pub fn add_bytes_stored(&self, n: u64) {
        self.state.bytes_stored.fetch_add(n, Ordering::Relaxed);
    }

    /// Publish the measured total cache size (pruner only)
    pub fn set_cache_size(&self, bytes: u64) {
        self.state.cache_size_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Record entries and bytes removed by a pruning cycle
    pub fn record_pruned(&self, entries: u64, bytes: u64) {
        self.state.pruned_entries.fetch_add(entries, Ordering::Relaxed);
        self.state.pruned_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a failed deletion or an aborted cycle
    pub fn record_pruning_error(&self) {
        self.state.pruning_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished cycle, pruned or no-op
    pub fn record_pruning_cycle(&self, pruned: bool) {
        if pruned {
            self.state.pruning_cycles_pruned.fetch_add(1, Ordering::Relaxed);
        } else {
            self.state.pruning_cycles_noop.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the duration of a pruning cycle
    pub fn observe_pruning(&self, duration: Duration) {
        self.state.pruning_duration.observe(duration);
    }

    /// Record a completed RPC with its outcome
    pub fn record_grpc(&self, method: RpcMethod, outcome: RpcOutcome) {
        self.state.grpc_requests[method.index()][outcome.index()]
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record the duration of an RPC
    pub fn observe_grpc(&self, method: RpcMethod, duration: Duration) {
        self.state.grpc_duration[method.index()].observe(duration);
    }

    /// Current hit count (for tests and snapshots)
    #[must_use]
    pub fn cache_hits(&self) -> u64 {
        self.state.cache_hits.load(Ordering::Relaxed)
    }

    /// Current miss count (for tests and snapshots)
    #[must_use]
    pub fn cache_misses(&self) -> u64 {
        self.state.cache_misses.load(Ordering::Relaxed)
    }

    /// Last published cache size in bytes
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.state.cache_size_bytes.load(Ordering::Relaxed)
    }

    /// Export all series in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let s = &self.state;
        let mut out = String::with_capacity(8 * 1024);

        out.push_str("# HELP cache_hits_total Total number of cache hits and misses\n");
        out.push_str("# TYPE cache_hits_total counter\n");
        let _ = writeln!(
            out,
            "cache_hits_total{{result=\"hit\"}} {}",
            s.cache_hits.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "cache_hits_total{{result=\"miss\"}} {}",
            s.cache_misses.load(Ordering::Relaxed)
        );

        out.push_str("# HELP cache_writes_total Total number of cache writes\n");
        out.push_str("# TYPE cache_writes_total counter\n");
        let _ = writeln!(
            out,
            "cache_writes_total {}",
            s.cache_writes.load(Ordering::Relaxed)
        );

        out.push_str("# HELP cache_deletions_total Total number of cache deletions\n");
        out.push_str("# TYPE cache_deletions_total counter\n");
        let _ = writeln!(
            out,
            "cache_deletions_total {}",
            s.cache_deletions.load(Ordering::Relaxed)
        );

        out.push_str("# HELP cache_errors_total Total number of cache operation errors\n");
        out.push_str("# TYPE cache_errors_total counter\n");
        for op in CacheOp::ALL {
            let _ = writeln!(
                out,
                "cache_errors_total{{operation=\"{}\"}} {}",
                op.as_str(),
                s.cache_errors[op.index()].load(Ordering::Relaxed)
            );
        }

        out.push_str("# HELP cache_operation_duration_seconds Duration of cache operations\n");
        out.push_str("# TYPE cache_operation_duration_seconds histogram\n");
        for op in CacheOp::ALL {
            s.cache_op_duration[op.index()].render(
                &mut out,
                "cache_operation_duration_seconds",
                &format!("operation=\"{}\"", op.as_str()),
            );
        }

        out.push_str("# HELP cache_bytes_transferred_total Bytes moved through the data plane\n");
        out.push_str("# TYPE cache_bytes_transferred_total counter\n");
        let _ = writeln!(
            out,
            "cache_bytes_transferred_total{{direction=\"served\"}} {}",
            s.bytes_served.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "cache_bytes_transferred_total{{direction=\"stored\"}} {}",
            s.bytes_stored.load(Ordering::Relaxed)
        );

        out.push_str("# HELP cache_size_bytes Total cache size as last measured by the pruner\n");
        out.push_str("# TYPE cache_size_bytes gauge\n");
        let _ = writeln!(
            out,
            "cache_size_bytes {}",
            s.cache_size_bytes.load(Ordering::Relaxed)
        );

        out.push_str("# HELP pruned_entries_total Total number of cache entries pruned\n");
        out.push_str("# TYPE pruned_entries_total counter\n");
        let _ = writeln!(
            out,
            "pruned_entries_total {}",
            s.pruned_entries.load(Ordering::Relaxed)
        );

        out.push_str("# HELP pruned_bytes_total Total bytes pruned from the cache\n");
        out.push_str("# TYPE pruned_bytes_total counter\n");
        let _ = writeln!(
            out,
            "pruned_bytes_total {}",
            s.pruned_bytes.load(Ordering::Relaxed)
        );

        out.push_str("# HELP pruning_errors_total Total number of pruning errors\n");
        out.push_str("# TYPE pruning_errors_total counter\n");
        let _ = writeln!(
            out,
            "pruning_errors_total {}",
            s.pruning_errors.load(Ordering::Relaxed)
        );

        out.push_str("# HELP pruning_cycles_total Completed pruning cycles by outcome\n");
        out.push_str("# TYPE pruning_cycles_total counter\n");
        let _ = writeln!(
            out,
            "pruning_cycles_total{{outcome=\"noop\"}} {}",
            s.pruning_cycles_noop.load(Ordering::Relaxed)
        );
        let _ = writeln!(
            out,
            "pruning_cycles_total{{outcome=\"pruned\"}} {}",
            s.pruning_cycles_pruned.load(Ordering::Relaxed)
        );

        out.push_str("# HELP pruning_duration_seconds Duration of pruning cycles\n");
        out.push_str("# TYPE pruning_duration_seconds histogram\n");
        s.pruning_duration.render(&mut out, "pruning_duration_seconds", "");

        out.push_str("# HELP grpc_requests_total Total number of gRPC requests\n");
        out.push_str("# TYPE grpc_requests_total counter\n");
        for method in RpcMethod::ALL {
            for outcome in RpcOutcome::ALL {
                let _ = writeln!(
                    out,
                    "grpc_requests_total{{method=\"{}\",status=\"{}\"}} {}",
                    method.as_str(),
                    outcome.as_str(),
                    s.grpc_requests[method.index()][outcome.index()].load(Ordering::Relaxed)
                );
            }
        }

        out.push_str("# HELP grpc_request_duration_seconds Duration of gRPC requests\n");
        out.push_str("# TYPE grpc_request_duration_seconds histogram\n");
        for method in RpcMethod::ALL {
            s.grpc_duration[method.index()].render(
                &mut out,
                "grpc_request_duration_seconds",
                &format!("method=\"{}\"", method.as_str()),
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(false);

        assert_eq!(metrics.cache_hits(), 2);
        assert_eq!(metrics.cache_misses(), 1);
    }

    #[test]
    fn test_gauge_overwrites() {
        let metrics = MetricsCollector::new();
        metrics.set_cache_size(100);
        metrics.set_cache_size(42);
        assert_eq!(metrics.cache_size(), 42);
    }

    #[test]
    fn test_prometheus_export_contains_series() {
        let metrics = MetricsCollector::new();
        metrics.record_cache_lookup(true);
        metrics.record_cache_write();
        metrics.record_grpc(RpcMethod::Get, RpcOutcome::Success);
        metrics.observe_grpc(RpcMethod::Get, Duration::from_millis(3));
        metrics.record_pruned(5, 5 * 1024 * 1024);

        let text = metrics.export_prometheus();
        assert!(text.contains("cache_hits_total{result=\"hit\"} 1"));
        assert!(text.contains("cache_writes_total 1"));
        assert!(text.contains("grpc_requests_total{method=\"Get\",status=\"success\"} 1"));
        assert!(text.contains("pruned_entries_total 5"));
        assert!(text.contains("pruned_bytes_total 5242880"));
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = MetricsCollector::new();
        metrics.observe_grpc(RpcMethod::Put, Duration::from_micros(500));
        metrics.observe_grpc(RpcMethod::Put, Duration::from_millis(10));

        let text = metrics.export_prometheus();
        // Both observations fall at or below the 16ms bucket
        assert!(text
            .contains("grpc_request_duration_seconds_bucket{method=\"Put\",le=\"0.016\"} 2"));
        assert!(text.contains("grpc_request_duration_seconds_count{method=\"Put\"} 2"));
    }

    #[test]
    fn test_histogram_overflow_lands_in_inf() {
        let metrics = MetricsCollector::new();
        metrics.observe_cache_op(CacheOp::Put, Duration::from_secs(60));

        let text = metrics.export_prometheus();
        assert!(text.contains(
            "cache_operation_duration_seconds_bucket{operation=\"put\",le=\"16.384\"} 0"
        ));
        assert!(text.contains(
            "cache_operation_duration_seconds_bucket{operation=\"put\",le=\"+Inf\"} 1"
        ));
    }

    #[test]
    fn test_clones_share_state() {
        let metrics = MetricsCollector::new();
        let clone = metrics.clone();
        clone.record_cache_lookup(true);
        assert_eq!(metrics.cache_hits(), 1);
    }
}
