//! Background pruning controller for the forgecache bucket
//!
//! Periodically measures total cache size and, when it exceeds the
//! budget, deletes entries in two phases: an absolute retention sweep
//! followed by an LRU walk gated by a minimum-age floor. The controller
//! performs no coordination with in-flight reads; deletion races resolve
//! through the object store's commit atomicity.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forgecache_core::{Config, MetricsCollector, Result};
use forgecache_storage::ObjectStore;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

/// All cache entries live under this prefix
const CACHE_PREFIX: &str = "cache/";

/// Entries not read within a week are always eligible in the LRU walk
const STALE_AGE_DAYS: i64 = 7;

/// Large entries become eligible sooner
const LARGE_ENTRY_BYTES: u64 = 100 * 1024 * 1024;
const LARGE_ENTRY_AGE_DAYS: i64 = 3;

/// Entries read within the last day are never deleted by the LRU walk
const RECENT_AGE_HOURS: i64 = 24;

/// Immutable pruning policy
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    /// Soft ceiling on total cache size in bytes
    pub max_total_bytes: u64,
    /// Fraction of the ceiling a cycle aims to leave occupied
    pub target_utilization: f64,
    /// Absolute retention: entries unread this long are swept outright
    pub retention_days: u32,
    /// Minimum age below which an entry is exempt from the LRU walk
    pub retention_floor: Duration,
    /// Wall-clock period between cycles
    pub interval: Duration,
    /// Deletions between informational progress reports
    pub delete_batch: usize,
}

impl PrunerConfig {
    /// Derive the policy from the application config
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_total_bytes: config.max_cache_size_bytes(),
            target_utilization: config.target_utilization,
            retention_days: config.retention_days,
            retention_floor: config.retention_floor(),
            interval: config.prune_interval(),
            delete_batch: config.delete_batch,
        }
    }
}

/// Totals reported after each cycle
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    /// Entries seen during measurement
    pub scanned: u64,
    /// Total size in bytes before any deletion
    pub total_bytes: u64,
    /// Entries deleted this cycle
    pub deleted: u64,
    /// Bytes reclaimed this cycle
    pub bytes_freed: u64,
}

#[derive(Debug, Clone)]
struct PruneCandidate {
    name: String,
    size: u64,
    last_accessed: DateTime<Utc>,
}

/// The pruning controller
pub struct Pruner {
    store: Arc<dyn ObjectStore>,
    metrics: MetricsCollector,
    config: PrunerConfig,
}

impl Pruner {
    /// Create a controller over the given store
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, metrics: MetricsCollector, config: PrunerConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Run cycles until the shutdown signal flips
    ///
    /// The first cycle fires immediately. A tick that arrives while a
    /// cycle is still running is dropped, not queued.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_size_gb = self.config.max_total_bytes / (1024 * 1024 * 1024),
            retention_days = self.config.retention_days,
            "Starting cache pruning service"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Stopping pruning service");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_cycle(&shutdown).await {
                        error!(error = %err, "Pruning cycle failed");
                        self.metrics.record_pruning_error();
                    }
                }
            }
        }
    }

    /// Execute a single pruning cycle
    ///
    /// A measurement error aborts the cycle; per-entry delete errors are
    /// counted and skipped. The shutdown receiver is consulted between
    /// iteration items and deletions.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleStats> {
        let start = Instant::now();
        let result = self.cycle_inner(shutdown).await;
        self.metrics.observe_pruning(start.elapsed());

        if let Ok(stats) = &result {
            info!(
                scanned = stats.scanned,
                deleted = stats.deleted,
                bytes_freed_mb = stats.bytes_freed / (1024 * 1024),
                duration_ms = start.elapsed().as_millis() as u64,
                "Pruning cycle finished"
            );
        }
        result
    }

    async fn cycle_inner(&self, shutdown: &watch::Receiver<bool>) -> Result<CycleStats> {
        info!("Starting cache pruning cycle");

        // Single pass over the bucket gives both the measurement and the
        // candidate list
        let mut entries = Vec::new();
        let mut total: u64 = 0;
        let mut stream = self.store.iterate(CACHE_PREFIX).await?;
        while let Some(item) = stream.next().await {
            if *shutdown.borrow() {
                info!("Pruning interrupted by shutdown during measurement");
                return Ok(CycleStats::default());
            }
            let attrs = item?;
            total += attrs.size;
            entries.push(PruneCandidate {
                name: attrs.name.clone(),
                size: attrs.size,
                last_accessed: attrs.last_accessed(),
            });
        }

        self.metrics.set_cache_size(total);

        let mut stats = CycleStats {
            scanned: entries.len() as u64,
            total_bytes: total,
            ..CycleStats::default()
        };

        info!(
            total_mb = total / (1024 * 1024),
            max_mb = self.config.max_total_bytes / (1024 * 1024),
            scanned = stats.scanned,
            "Measured cache size"
        );

        if total <= self.config.max_total_bytes {
            info!("Cache size within limits, no pruning needed");
            self.metrics.record_pruning_cycle(false);
            return Ok(stats);
        }

        let target = (self.config.max_total_bytes as f64 * self.config.target_utilization) as u64;
        let mut bytes_to_free = total.saturating_sub(target) as i64;

        info!(
            bytes_to_free_mb = bytes_to_free / (1024 * 1024),
            target_mb = target / (1024 * 1024),
            "Pruning required"
        );

        let now = Utc::now();
        let retention_cutoff = now - ChronoDuration::days(i64::from(self.config.retention_days));

        // Phase I: absolute retention sweep
        let mut candidates = Vec::with_capacity(entries.len());
        for entry in entries {
            if *shutdown.borrow() {
                info!("Pruning interrupted by shutdown during sweep");
                return Ok(stats);
            }
            if entry.last_accessed < retention_cutoff {
                if self.delete_entry(&entry).await {
                    stats.deleted += 1;
                    stats.bytes_freed += entry.size;
                    bytes_to_free -= entry.size as i64;
                    self.report_progress(&stats);
                }
            } else {
                candidates.push(entry);
            }
        }

        // Phase II: LRU by last_accessed
        if bytes_to_free > 0 {
            sort_candidates(&mut candidates);

            for entry in &candidates {
                if bytes_to_free <= 0 {
                    break;
                }
                if *shutdown.borrow() {
                    info!("Pruning interrupted by shutdown during LRU walk");
                    return Ok(stats);
                }
                if !eligible(entry, now, self.config.retention_floor) {
                    continue;
                }
                if self.delete_entry(entry).await {
                    stats.deleted += 1;
                    stats.bytes_freed += entry.size;
                    bytes_to_free -= entry.size as i64;
                    self.report_progress(&stats);
                }
            }
        }

        self.metrics.record_pruned(stats.deleted, stats.bytes_freed);
        self.metrics.record_pruning_cycle(true);
        self.metrics.set_cache_size(total - stats.bytes_freed);
        Ok(stats)
    }

    /// Delete one entry, counting but not propagating failures
    async fn delete_entry(&self, entry: &PruneCandidate) -> bool {
        debug!(
            name = %entry.name,
            size = entry.size,
            last_accessed = %entry.last_accessed,
            "Deleting cache entry"
        );
        match self.store.delete(&entry.name).await {
            Ok(()) => {
                self.metrics.record_cache_deletion();
                true
            }
            Err(err) => {
                error!(name = %entry.name, error = %err, "Failed to delete cache entry");
                self.metrics.record_pruning_error();
                false
            }
        }
    }

    fn report_progress(&self, stats: &CycleStats) {
        if stats.deleted > 0 && stats.deleted as usize % self.config.delete_batch == 0 {
            info!(
                deleted = stats.deleted,
                bytes_freed_mb = stats.bytes_freed / (1024 * 1024),
                "Pruning progress"
            );
        }
    }
}

/// Deterministic LRU ordering: oldest access first, ties broken by
/// ascending size then name
fn sort_candidates(candidates: &mut [PruneCandidate]) {
    candidates.sort_by(|a, b| {
        a.last_accessed
            .cmp(&b.last_accessed)
            .then(a.size.cmp(&b.size))
            .then(a.name.cmp(&b.name))
    });
}

/// Whether the LRU walk may delete this entry
fn eligible(entry: &PruneCandidate, now: DateTime<Utc>, floor: Duration) -> bool {
    let age = now - entry.last_accessed;

    let floor = ChronoDuration::from_std(floor).unwrap_or_else(|_| ChronoDuration::days(1));
    if age < floor {
        return false;
    }

    if age > ChronoDuration::days(STALE_AGE_DAYS) {
        return true;
    }

    if entry.size > LARGE_ENTRY_BYTES && age > ChronoDuration::days(LARGE_ENTRY_AGE_DAYS) {
        return true;
    }

    if age < ChronoDuration::hours(RECENT_AGE_HOURS) {
        return false;
    }

    true
}
