use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Engine-wide configuration: data directories, executor sizing, and the
/// background scheduler cadence.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data directories. Flushes shard their output across these; each
    /// directory gets its own flush IO worker pool.
    pub data_dirs: Vec<PathBuf>,

    /// Size of each per-directory flush IO pool.
    pub flush_writers: usize,

    /// Queue depth for each bounded executor. Submissions beyond this are
    /// rejected rather than blocking the submitter.
    pub executor_queue_depth: usize,

    /// Compaction worker pool size.
    pub compaction_workers: usize,

    /// Soft memtable memory limit per table, in bytes. Crossing it requests
    /// a flush; writers stall once a blocking flush barrier is pending and
    /// the limit is still exceeded.
    pub memtable_soft_limit: usize,

    /// Hard-links created per second while snapshotting.
    pub snapshot_links_per_second: u32,

    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check memtable flush periods (default: 1s)
    pub flush_check_interval: Duration,

    /// How often to check for compaction opportunities (default: 10s)
    pub compaction_interval: Duration,

    /// How often to log table metrics (default: 60s)
    pub metrics_interval: Duration,

    /// How often to recompute speculative-retry thresholds from latency
    /// samples (default: 10s)
    pub speculation_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dirs: vec![PathBuf::from("./tephra")],
            flush_writers: 2,
            executor_queue_depth: 64,
            compaction_workers: 2,
            memtable_soft_limit: 64 * 1024 * 1024,
            snapshot_links_per_second: 1000,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_check_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(60),
            speculation_interval: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dirs: vec![dir.into()],
            ..Default::default()
        }
    }

    /// Spread data across several directories, one flush shard per directory.
    pub fn data_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.data_dirs = dirs;
        self
    }

    pub fn flush_writers(mut self, n: usize) -> Self {
        self.flush_writers = n;
        self
    }

    pub fn compaction_workers(mut self, n: usize) -> Self {
        self.compaction_workers = n;
        self
    }

    pub fn memtable_soft_limit(mut self, bytes: usize) -> Self {
        self.memtable_soft_limit = bytes;
        self
    }

    pub fn snapshot_links_per_second(mut self, n: u32) -> Self {
        self.snapshot_links_per_second = n;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dirs.is_empty() {
            return Err(Error::Config("at least one data directory".to_string()));
        }
        if self.flush_writers == 0 {
            return Err(Error::Config("flush_writers must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl SchedulerConfig {
    pub fn flush_check_interval(mut self, interval: Duration) -> Self {
        self.flush_check_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}

/// Per-table parameters. These correspond to the recognized table options;
/// everything here survives schema reloads.
#[derive(Debug, Clone)]
pub struct TableParams {
    /// Upper bound on time between flushes. Zero disables periodic flushes.
    pub memtable_flush_period: Duration,

    /// Minimum age before a tombstone may be purged.
    pub gc_grace: Duration,

    /// Rows cached per partition by the read path. Zero disables the row
    /// cache for this table.
    pub rows_per_partition_to_cache: u32,

    /// Probability of verifying record checksums on read.
    pub crc_check_chance: f64,

    /// Strategy inputs. Zero is forbidden.
    pub min_compaction_threshold: usize,
    pub max_compaction_threshold: usize,

    /// Tags updates so flushed files mark CDC segments as retained.
    pub cdc: bool,

    /// If false, mutations skip the commit log entirely.
    pub durable_writes: bool,

    /// Latency percentile driving the additional-write threshold.
    pub additional_write_policy: SpeculationPolicy,

    /// Latency percentile driving speculative retry.
    pub speculative_retry: SpeculationPolicy,
}

/// Threshold policy recomputed from coordinator latency samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeculationPolicy {
    Never,
    Always,
    Percentile(f64),
    Fixed(Duration),
}

impl Default for TableParams {
    fn default() -> Self {
        Self {
            memtable_flush_period: Duration::ZERO,
            gc_grace: Duration::from_secs(864000),
            rows_per_partition_to_cache: 0,
            crc_check_chance: 1.0,
            min_compaction_threshold: 4,
            max_compaction_threshold: 32,
            cdc: false,
            durable_writes: true,
            additional_write_policy: SpeculationPolicy::Percentile(99.0),
            speculative_retry: SpeculationPolicy::Percentile(99.0),
        }
    }
}

impl TableParams {
    pub fn gc_grace(mut self, grace: Duration) -> Self {
        self.gc_grace = grace;
        self
    }

    pub fn memtable_flush_period(mut self, period: Duration) -> Self {
        self.memtable_flush_period = period;
        self
    }

    pub fn rows_per_partition_to_cache(mut self, rows: u32) -> Self {
        self.rows_per_partition_to_cache = rows;
        self
    }

    pub fn crc_check_chance(mut self, chance: f64) -> Self {
        self.crc_check_chance = chance;
        self
    }

    pub fn compaction_thresholds(mut self, min: usize, max: usize) -> Self {
        self.min_compaction_threshold = min;
        self.max_compaction_threshold = max;
        self
    }

    pub fn cdc(mut self, enabled: bool) -> Self {
        self.cdc = enabled;
        self
    }

    pub fn durable_writes(mut self, enabled: bool) -> Self {
        self.durable_writes = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_compaction_threshold == 0 || self.max_compaction_threshold == 0 {
            return Err(Error::Config(
                "compaction thresholds must be non-zero".to_string(),
            ));
        }
        if self.min_compaction_threshold > self.max_compaction_threshold {
            return Err(Error::Config(format!(
                "min_compaction_threshold {} exceeds max {}",
                self.min_compaction_threshold, self.max_compaction_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.crc_check_chance) {
            return Err(Error::Config(format!(
                "crc_check_chance {} outside [0, 1]",
                self.crc_check_chance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.data_dirs, vec![PathBuf::from("./tephra")]);
        assert_eq!(config.memtable_soft_limit, 64 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new("/tmp/test")
            .flush_writers(4)
            .memtable_soft_limit(32 * 1024 * 1024)
            .scheduler(
                SchedulerConfig::default()
                    .flush_check_interval(Duration::from_millis(500))
                    .compaction_interval(Duration::from_secs(5)),
            );

        assert_eq!(config.data_dirs, vec![PathBuf::from("/tmp/test")]);
        assert_eq!(config.flush_writers, 4);
        assert_eq!(
            config.scheduler.flush_check_interval,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_zero_threshold_forbidden() {
        let params = TableParams::default().compaction_thresholds(0, 32);
        assert!(matches!(params.validate(), Err(Error::Config(_))));

        let params = TableParams::default().compaction_thresholds(8, 4);
        assert!(matches!(params.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_crc_chance_range() {
        let params = TableParams::default().crc_check_chance(1.5);
        assert!(matches!(params.validate(), Err(Error::Config(_))));
    }
}
