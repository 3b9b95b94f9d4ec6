//! In-memory write buffer for one table.
//!
//! A memtable is a concurrent skip list of partition key to pending
//! partition update. Writers merge updates in under an operation-order
//! group; the flush pipeline freezes the memtable with `switch_out`, hands
//! it a shared commit-log upper bound, and later drains it shard by shard
//! through `flush_set`.
//!
//! Lifecycle: active, then switched out, then flushing, then discarded.
//! Mutation is legal only while active. After `switch_out` the latched
//! upper bound is at or above every log position a writer observed before
//! the switch, which is the invariant the write barrier enforces.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::commitlog::ReplayPosition;
use crate::flush::FlushReason;
use crate::oporder::{Barrier, Group};
use crate::partition::key::{PartitionKey, Token};
use crate::partition::update::{PartitionUpdate, PutDelta};
use crate::schema::TableSchema;

/// Commit-log position that only moves forward. Shared between a table's
/// memtable and its index tables' memtables during a switch so they all
/// latch the same upper bound.
pub struct LogPositionBound {
    position: RwLock<ReplayPosition>,
}

impl LogPositionBound {
    pub fn new(initial: ReplayPosition) -> Self {
        Self {
            position: RwLock::new(initial),
        }
    }

    /// Advances to `pos` if it is ahead; otherwise leaves the bound alone.
    pub fn advance_to(&self, pos: ReplayPosition) {
        let mut current = self.position.write().unwrap();
        if pos > *current {
            *current = pos;
        }
    }

    pub fn get(&self) -> ReplayPosition {
        *self.position.read().unwrap()
    }
}

/// Hook for secondary-index maintenance, invoked for every update applied
/// to the memtable.
pub trait Indexer: Send + Sync {
    fn index(&self, update: &PartitionUpdate);
}

/// Indexer for tables without indexes.
pub struct NoopIndexer;

impl Indexer for NoopIndexer {
    fn index(&self, _update: &PartitionUpdate) {}
}

pub struct Memtable {
    schema: Arc<TableSchema>,
    partitions: SkipMap<PartitionKey, Mutex<PartitionUpdate>>,
    live_bytes: AtomicUsize,
    ops: AtomicUsize,
    soft_limit: usize,
    /// Where this memtable's log coverage starts. A replacement memtable
    /// shares its predecessor's upper-bound cell here, which is what makes
    /// consecutive memtables contiguous in the log.
    lower_bound: Arc<LogPositionBound>,
    upper_bound: OnceLock<Arc<LogPositionBound>>,
    switched: AtomicBool,
    cdc_dirty: AtomicBool,
}

impl Memtable {
    pub fn new(
        schema: Arc<TableSchema>,
        lower_bound: Arc<LogPositionBound>,
        soft_limit: usize,
    ) -> Self {
        Self {
            schema,
            partitions: SkipMap::new(),
            live_bytes: AtomicUsize::new(0),
            ops: AtomicUsize::new(0),
            soft_limit,
            lower_bound,
            upper_bound: OnceLock::new(),
            switched: AtomicBool::new(false),
            cdc_dirty: AtomicBool::new(false),
        }
    }

    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Merges `update` in. Must be called inside an active write group; the
    /// group argument is the proof. Returns `None` if the memtable has been
    /// switched out, in which case the caller re-reads the tracker view and
    /// retries against the replacement.
    pub fn put(
        &self,
        update: &PartitionUpdate,
        indexer: &dyn Indexer,
        _group: &Group,
    ) -> Option<PutDelta> {
        if self.switched.load(Ordering::SeqCst) {
            return None;
        }

        let entry = self
            .partitions
            .get_or_insert_with(update.key().clone(), || {
                Mutex::new(PartitionUpdate::new(update.table_id(), update.key().clone()))
            });
        let delta = entry.value().lock().unwrap().merge(update);

        self.live_bytes.fetch_add(delta.bytes, Ordering::SeqCst);
        self.ops.fetch_add(1, Ordering::SeqCst);
        if update.cdc {
            self.cdc_dirty.store(true, Ordering::SeqCst);
        }
        indexer.index(update);
        Some(delta)
    }

    /// Point lookup; clones the pending state for the key.
    pub fn get(&self, key: &PartitionKey) -> Option<PartitionUpdate> {
        self.partitions
            .get(key)
            .map(|entry| entry.value().lock().unwrap().clone())
    }

    /// Lazy iterator over partitions intersecting `range`, in key order.
    /// A single iteration consumes it; call again for a fresh pass.
    pub fn partition_iterator(
        self: &Arc<Self>,
        range: (Bound<PartitionKey>, Bound<PartitionKey>),
    ) -> MemtablePartitionIterator {
        MemtablePartitionIterator {
            memtable: Arc::clone(self),
            after: None,
            range,
            exhausted: false,
        }
    }

    /// True iff no put has mutated state.
    pub fn is_clean(&self) -> bool {
        self.ops.load(Ordering::SeqCst) == 0
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn operation_count(&self) -> usize {
        self.ops.load(Ordering::SeqCst)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_cdc_dirty(&self) -> bool {
        self.cdc_dirty.load(Ordering::SeqCst)
    }

    pub fn over_soft_limit(&self) -> bool {
        self.live_bytes() >= self.soft_limit
    }

    /// Whether this flush reason should actually take effect for this
    /// memtable. A clean memtable absorbs most reasons into a no-op;
    /// truncation, drop and shutdown always switch.
    pub fn should_switch(&self, reason: FlushReason) -> bool {
        match reason {
            FlushReason::MemtableLimit => self.over_soft_limit(),
            FlushReason::Truncate | FlushReason::Drop | FlushReason::Shutdown => true,
            _ => !self.is_clean(),
        }
    }

    /// Freezes the memtable. The barrier is the witness that every put that
    /// saw this memtable as current will have closed its group before the
    /// flush proceeds; the shared bound is latched so the final log
    /// position can only move forward from here.
    pub fn switch_out(&self, barrier: &Barrier, upper_bound: Arc<LogPositionBound>) {
        debug_assert!(
            !barrier.is_issued(),
            "memtable must be switched before the write barrier is issued"
        );
        self.upper_bound
            .set(upper_bound)
            .unwrap_or_else(|_| panic!("memtable switched out twice"));
        self.switched.store(true, Ordering::SeqCst);
    }

    pub fn is_switched(&self) -> bool {
        self.switched.load(Ordering::SeqCst)
    }

    pub fn initial_log_position(&self) -> ReplayPosition {
        self.lower_bound.get()
    }

    /// Latched at switch-out; at or above every position observed by a put
    /// into this memtable. `None` while still active.
    pub fn final_log_position(&self) -> Option<ReplayPosition> {
        self.upper_bound.get().map(|bound| bound.get())
    }

    /// Content slice for one flush shard: partitions whose token falls in
    /// `range`, in key order, empty partitions skipped.
    pub fn flush_set(
        &self,
        range: (Bound<Token>, Bound<Token>),
    ) -> impl Iterator<Item = PartitionUpdate> + '_ {
        self.partitions
            .iter()
            .filter(move |entry| range_contains(&range, entry.key().token()))
            .filter_map(|entry| {
                let update = entry.value().lock().unwrap();
                if update.is_empty() {
                    None
                } else {
                    Some(update.clone())
                }
            })
    }

    /// Final step of the lifecycle: returns the buffered memory. Runs on the
    /// reclaim executor after a read barrier confirmed no in-flight reader
    /// still holds this memtable.
    pub fn discard(&self) {
        debug_assert!(self.is_switched());
        while let Some(entry) = self.partitions.front() {
            entry.remove();
        }
        self.live_bytes.store(0, Ordering::SeqCst);
    }
}

fn range_contains(range: &(Bound<Token>, Bound<Token>), token: Token) -> bool {
    let lower_ok = match &range.0 {
        Bound::Included(t) => token >= *t,
        Bound::Excluded(t) => token > *t,
        Bound::Unbounded => true,
    };
    let upper_ok = match &range.1 {
        Bound::Included(t) => token <= *t,
        Bound::Excluded(t) => token < *t,
        Bound::Unbounded => true,
    };
    lower_ok && upper_ok
}

/// Lazy partition iterator over a memtable. Snapshots nothing up front:
/// each advance re-enters the skip list after the last yielded key, so the
/// iterator stays valid while writers keep inserting.
pub struct MemtablePartitionIterator {
    memtable: Arc<Memtable>,
    after: Option<PartitionKey>,
    range: (Bound<PartitionKey>, Bound<PartitionKey>),
    exhausted: bool,
}

impl Iterator for MemtablePartitionIterator {
    type Item = PartitionUpdate;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let memtable = Arc::clone(&self.memtable);
        loop {
            let lower = match &self.after {
                Some(key) => Bound::Excluded(key.clone()),
                None => self.range.0.clone(),
            };
            let upper = self.range.1.clone();
            let entry = memtable.partitions.range((lower, upper)).next();
            match entry {
                Some(entry) => {
                    self.after = Some(entry.key().clone());
                    let update = entry.value().lock().unwrap().clone();
                    if update.is_empty() {
                        continue;
                    }
                    return Some(update);
                }
                None => {
                    self.exhausted = true;
                    return None;
                }
            }
        }
    }
}
