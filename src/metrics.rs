//! Per-table metrics: operation counters, the write-interval histogram,
//! and the latency samples behind speculative-retry thresholds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::config::SpeculationPolicy;

/// Exponential histogram of the time distance between a write and the cell
/// it overwrote. Values past the largest bucket clamp into it.
#[derive(Debug)]
pub struct WriteIntervalHistogram {
    /// bucket i counts deltas in [2^i, 2^(i+1)) microseconds.
    buckets: [u64; 40],
}

impl WriteIntervalHistogram {
    pub fn new() -> Self {
        Self { buckets: [0; 40] }
    }

    pub fn record(&mut self, delta_micros: i64) {
        let delta = delta_micros.max(0) as u64;
        let slot = (64 - delta.max(1).leading_zeros() as usize - 1).min(self.buckets.len() - 1);
        self.buckets[slot] += 1;
    }

    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn bucket(&self, slot: usize) -> u64 {
        self.buckets[slot]
    }

    pub fn max_bucket(&self) -> u64 {
        *self.buckets.last().unwrap()
    }
}

impl Default for WriteIntervalHistogram {
    fn default() -> Self {
        Self::new()
    }
}

const LATENCY_SAMPLE_CAP: usize = 1024;

pub struct TableMetrics {
    name: String,
    writes: AtomicU64,
    reads: AtomicU64,
    flushes: AtomicU64,
    bytes_flushed: AtomicU64,
    compactions: AtomicU64,
    bytes_compacted: AtomicU64,
    write_interval: Mutex<WriteIntervalHistogram>,
    read_latencies: Mutex<Vec<Duration>>,
    speculation_threshold: RwLock<Duration>,
}

impl TableMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            bytes_flushed: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            bytes_compacted: AtomicU64::new(0),
            write_interval: Mutex::new(WriteIntervalHistogram::new()),
            read_latencies: Mutex::new(Vec::new()),
            speculation_threshold: RwLock::new(Duration::from_millis(100)),
        }
    }

    /// Records a write; `overwrite_delta` is the timestamp distance to the
    /// overwritten cell, when one existed.
    pub fn record_write(&self, overwrite_delta: Option<i64>) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(delta) = overwrite_delta {
            self.write_interval.lock().unwrap().record(delta);
        }
    }

    pub fn record_read(&self, latency: Duration) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.read_latencies.lock().unwrap();
        if samples.len() >= LATENCY_SAMPLE_CAP {
            // Overwrite a pseudo-random slot to keep a rolling sample.
            let slot = (latency.subsec_nanos() as usize) % LATENCY_SAMPLE_CAP;
            samples[slot] = latency;
        } else {
            samples.push(latency);
        }
    }

    pub fn record_flush(&self, bytes: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_compaction(&self, bytes_written: u64) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.bytes_compacted.fetch_add(bytes_written, Ordering::Relaxed);
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn compaction_count(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    pub fn write_interval_count(&self) -> u64 {
        self.write_interval.lock().unwrap().count()
    }

    /// Current speculative-retry threshold.
    pub fn speculation_threshold(&self) -> Duration {
        *self.speculation_threshold.read().unwrap()
    }

    /// Recomputes the speculation threshold from recent latency samples.
    /// Runs on the scheduler's cadence.
    pub fn recompute_speculation(&self, policy: SpeculationPolicy) {
        let threshold = match policy {
            SpeculationPolicy::Never => Duration::MAX,
            SpeculationPolicy::Always => Duration::ZERO,
            SpeculationPolicy::Fixed(duration) => duration,
            SpeculationPolicy::Percentile(p) => {
                let mut samples = self.read_latencies.lock().unwrap().clone();
                if samples.is_empty() {
                    return;
                }
                samples.sort();
                let rank = ((p / 100.0) * samples.len() as f64) as usize;
                samples[rank.min(samples.len() - 1)]
            }
        };
        *self.speculation_threshold.write().unwrap() = threshold;
    }

    /// Periodic one-line summary.
    pub fn log_summary(&self) {
        tracing::info!(
            table = %self.name,
            writes = self.write_count(),
            reads = self.read_count(),
            flushes = self.flush_count(),
            bytes_flushed = self.bytes_flushed.load(Ordering::Relaxed),
            compactions = self.compaction_count(),
            bytes_compacted = self.bytes_compacted.load(Ordering::Relaxed),
            "table metrics"
        );
    }
}
