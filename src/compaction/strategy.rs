//! Compaction strategies.
//!
//! Strategies differ by selection policy, not data model, so they are a
//! closed enum behind one interface: given the live set, pick the next
//! batch worth merging. The per-table [`StrategySlot`] wraps the policy
//! with the enable/pause switches and the unleveled bookkeeping the
//! manager consults.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use itertools::Itertools;

use crate::sstable::SsTable;
use crate::tracker::View;

#[derive(Debug, Clone)]
pub struct SizeTieredOptions {
    /// Files within `bucket_low..bucket_high` of a bucket's average size
    /// fall into that bucket.
    pub bucket_low: f64,
    pub bucket_high: f64,
    pub min_sstable_size: u64,
}

impl Default for SizeTieredOptions {
    fn default() -> Self {
        Self {
            bucket_low: 0.5,
            bucket_high: 1.5,
            min_sstable_size: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeveledOptions {
    /// Size multiplier between consecutive levels.
    pub fanout: u64,
    pub base_level_bytes: u64,
}

impl Default for LeveledOptions {
    fn default() -> Self {
        Self {
            fanout: 10,
            base_level_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeWindowOptions {
    /// Width of one time window, in seconds of max cell timestamp.
    pub window_seconds: u64,
}

impl Default for TimeWindowOptions {
    fn default() -> Self {
        Self {
            window_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnifiedOptions {
    pub size_tiered: SizeTieredOptions,
    pub leveled: LeveledOptions,
}

impl UnifiedOptions {
    fn new() -> Self {
        Self::default()
    }
}

/// The closed set of selection policies.
#[derive(Debug, Clone)]
pub enum CompactionStrategy {
    SizeTiered(SizeTieredOptions),
    Leveled(LeveledOptions),
    TimeWindow(TimeWindowOptions),
    Unified(UnifiedOptions),
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        CompactionStrategy::SizeTiered(SizeTieredOptions::default())
    }
}

impl CompactionStrategy {
    /// Picks the next batch to merge, or `None` when the live set is fine
    /// as it is. Files already reserved by another compaction are skipped.
    pub fn select_compaction(
        &self,
        view: &View,
        min_threshold: usize,
        max_threshold: usize,
        now_seconds: u32,
    ) -> Option<Vec<SsTable>> {
        let candidates: Vec<&SsTable> = view
            .live
            .iter()
            .filter(|t| !view.compacting.contains(&t.generation()))
            .collect();
        if candidates.len() < min_threshold {
            return None;
        }
        match self {
            CompactionStrategy::SizeTiered(options) => {
                select_size_tiered(&candidates, options, min_threshold, max_threshold)
            }
            CompactionStrategy::Leveled(options) => {
                select_leveled(&candidates, options, min_threshold, max_threshold)
            }
            CompactionStrategy::TimeWindow(options) => {
                select_time_window(&candidates, options, min_threshold, max_threshold, now_seconds)
            }
            CompactionStrategy::Unified(options) => {
                // Unified blends the two shapes: tiered while the table is
                // small, leveled once it outgrows the base size.
                let total: u64 = candidates.iter().map(|t| t.stats().data_size).sum();
                if total < options.leveled.base_level_bytes {
                    select_size_tiered(
                        &candidates,
                        &options.size_tiered,
                        min_threshold,
                        max_threshold,
                    )
                } else {
                    select_leveled(&candidates, &options.leveled, min_threshold, max_threshold)
                }
            }
        }
    }

    /// Whether outputs may be opened for reads before the merge finishes.
    pub fn supports_early_open(&self) -> bool {
        matches!(
            self,
            CompactionStrategy::SizeTiered(_) | CompactionStrategy::Unified(_)
        )
    }
}

fn select_size_tiered(
    candidates: &[&SsTable],
    options: &SizeTieredOptions,
    min_threshold: usize,
    max_threshold: usize,
) -> Option<Vec<SsTable>> {
    // Bucket by size: small files below min_sstable_size bucket together;
    // the rest bucket with neighbors within [low, high] of the running
    // average. Sorting first makes bucketing a single pass.
    let mut by_size: Vec<&SsTable> = candidates.to_vec();
    by_size.sort_by_key(|t| t.stats().data_size);

    let mut buckets: Vec<(f64, Vec<&SsTable>)> = Vec::new();
    for table in by_size {
        let size = table.stats().data_size as f64;
        let small = table.stats().data_size < options.min_sstable_size;
        match buckets.iter_mut().find(|(avg, bucket)| {
            (size >= *avg * options.bucket_low && size <= *avg * options.bucket_high)
                || (small && bucket[0].stats().data_size < options.min_sstable_size)
        }) {
            Some((avg, bucket)) => {
                bucket.push(table);
                *avg += (size - *avg) / bucket.len() as f64;
            }
            None => buckets.push((size, vec![table])),
        }
    }

    buckets
        .into_iter()
        .map(|(_, bucket)| bucket)
        .filter(|bucket| bucket.len() >= min_threshold)
        .sorted_by_key(|bucket| std::cmp::Reverse(bucket.len()))
        .next()
        .map(|bucket| bucket.into_iter().take(max_threshold).cloned().collect())
}

fn select_leveled(
    candidates: &[&SsTable],
    options: &LeveledOptions,
    min_threshold: usize,
    max_threshold: usize,
) -> Option<Vec<SsTable>> {
    // Levels are size classes: level n holds files up to
    // base * fanout^n. The most crowded class past the threshold merges.
    let level_of = |size: u64| -> u32 {
        let mut level = 0;
        let mut cap = options.base_level_bytes;
        while size > cap && level < 8 {
            level += 1;
            cap = cap.saturating_mul(options.fanout);
        }
        level
    };

    let groups = candidates
        .iter()
        .map(|t| (level_of(t.stats().data_size), *t))
        .into_group_map();
    groups
        .into_values()
        .filter(|group| group.len() >= min_threshold)
        .max_by_key(|group| group.len())
        .map(|group| {
            let mut group: Vec<&SsTable> = group;
            group.sort_by_key(|t| t.generation());
            group.into_iter().take(max_threshold).cloned().collect()
        })
}

fn select_time_window(
    candidates: &[&SsTable],
    options: &TimeWindowOptions,
    min_threshold: usize,
    max_threshold: usize,
    _now_seconds: u32,
) -> Option<Vec<SsTable>> {
    let window = |t: &SsTable| -> i64 {
        let seconds = t.stats().max_timestamp / 1_000_000;
        seconds.div_euclid(options.window_seconds as i64)
    };
    let groups = candidates
        .iter()
        .map(|t| (window(t), *t))
        .into_group_map();
    groups
        .into_iter()
        .filter(|(_, group)| group.len() >= min_threshold)
        .sorted_by_key(|(window, _)| *window)
        .next()
        .map(|(_, mut group)| {
            group.sort_by_key(|t| t.generation());
            group.into_iter().take(max_threshold).cloned().collect()
        })
}

/// A table's strategy plus its operational switches.
pub struct StrategySlot {
    strategy: Mutex<CompactionStrategy>,
    enabled: AtomicBool,
    paused: AtomicBool,
    /// Flush outputs the strategy has not yet folded into its shape.
    unleveled: Mutex<Vec<u64>>,
}

impl StrategySlot {
    pub fn new(strategy: CompactionStrategy) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            enabled: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            unleveled: Mutex::new(Vec::new()),
        }
    }

    pub fn select_compaction(
        &self,
        view: &View,
        min_threshold: usize,
        max_threshold: usize,
        now_seconds: u32,
    ) -> Option<Vec<SsTable>> {
        if !self.is_active() {
            return None;
        }
        self.strategy
            .lock()
            .unwrap()
            .select_compaction(view, min_threshold, max_threshold, now_seconds)
    }

    pub fn created_sstable(&self, generation: u64) {
        self.unleveled.lock().unwrap().push(generation);
    }

    pub fn replaced(&self, removed: &[u64], _added: &[u64]) {
        self.unleveled
            .lock()
            .unwrap()
            .retain(|g| !removed.contains(g));
    }

    pub fn get_unleveled_sstables(&self) -> Vec<u64> {
        self.unleveled.lock().unwrap().clone()
    }

    pub fn supports_early_open(&self) -> bool {
        self.strategy.lock().unwrap().supports_early_open()
    }

    pub fn set_strategy(&self, strategy: CompactionStrategy) {
        *self.strategy.lock().unwrap() = strategy;
    }

    pub fn disabled(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.paused.load(Ordering::SeqCst)
    }
}

impl Default for StrategySlot {
    fn default() -> Self {
        Self::new(CompactionStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_switches() {
        let slot = StrategySlot::default();
        assert!(slot.is_active());
        slot.pause();
        assert!(!slot.is_active());
        slot.resume();
        assert!(slot.is_active());
        slot.disabled();
        assert!(!slot.is_active());
        slot.enable();
        assert!(slot.is_active());
    }

    #[test]
    fn test_unleveled_bookkeeping() {
        let slot = StrategySlot::default();
        slot.created_sstable(1);
        slot.created_sstable(2);
        slot.created_sstable(3);
        assert_eq!(slot.get_unleveled_sstables(), vec![1, 2, 3]);

        slot.replaced(&[1, 2], &[4]);
        assert_eq!(slot.get_unleveled_sstables(), vec![3]);
    }

    #[test]
    fn test_unified_defaults() {
        let strategy = CompactionStrategy::Unified(UnifiedOptions::new());
        assert!(strategy.supports_early_open());
    }
}
