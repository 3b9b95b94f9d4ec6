//! The compaction manager: background selection, forced compactions,
//! cooperative interruption, and the global pause switch.

pub mod merge;
pub mod strategy;

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleTransaction, OperationType};
use crate::partition::key::PartitionKey;
use crate::partition::update::Timestamp;
use crate::schema::TableId;
use crate::sstable::{delete_components, Descriptor, FlatWriter, KeyBounds, SsTable, SsTableFormat, UNREPAIRED};
use crate::table::TableStore;

pub use merge::{MergeStats, PurgeController};
pub use strategy::{CompactionStrategy, StrategySlot};

/// Why a running operation was asked to stop. Polled between merged
/// partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    None,
    Compaction,
    Cleanup,
    Truncate,
    Shutdown,
    UnitTests,
}

impl StopTrigger {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StopTrigger::Compaction,
            2 => StopTrigger::Cleanup,
            3 => StopTrigger::Truncate,
            4 => StopTrigger::Shutdown,
            5 => StopTrigger::UnitTests,
            _ => StopTrigger::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StopTrigger::None => 0,
            StopTrigger::Compaction => 1,
            StopTrigger::Cleanup => 2,
            StopTrigger::Truncate => 3,
            StopTrigger::Shutdown => 4,
            StopTrigger::UnitTests => 5,
        }
    }
}

/// Cooperative stop flag shared with a running operation.
pub struct StopSignal(AtomicU8);

impl StopSignal {
    pub fn new() -> Self {
        Self(AtomicU8::new(StopTrigger::None.as_u8()))
    }

    pub fn get(&self) -> StopTrigger {
        StopTrigger::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn request(&self, trigger: StopTrigger) {
        self.0.store(trigger.as_u8(), Ordering::SeqCst);
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Compaction,
    Validation,
}

/// A registered running operation.
pub struct OperationState {
    pub id: u64,
    pub table: TableId,
    pub kind: OperationKind,
    pub inputs: Vec<u64>,
    pub stop: StopSignal,
}

/// Global compaction manager: one per engine, shared by every table
/// through the engine context.
pub struct CompactionManager {
    executor: Arc<crate::executor::Executor>,
    running: Mutex<Vec<Arc<OperationState>>>,
    pause_count: AtomicUsize,
    next_op_id: AtomicU64,
}

impl CompactionManager {
    pub fn new(executor: Arc<crate::executor::Executor>) -> Self {
        Self {
            executor,
            running: Mutex::new(Vec::new()),
            pause_count: AtomicUsize::new(0),
            next_op_id: AtomicU64::new(1),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::SeqCst) > 0
    }

    /// Stops new compactions from starting while the returned guard lives.
    pub fn pause_global(self: &Arc<Self>) -> CompactionPauser {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
        CompactionPauser {
            manager: Arc::clone(self),
        }
    }

    pub fn running_operations(&self) -> Vec<Arc<OperationState>> {
        self.running.lock().unwrap().clone()
    }

    fn register(
        &self,
        table: TableId,
        kind: OperationKind,
        inputs: Vec<u64>,
    ) -> Arc<OperationState> {
        let op = Arc::new(OperationState {
            id: self.next_op_id.fetch_add(1, Ordering::SeqCst),
            table,
            kind,
            inputs,
            stop: StopSignal::new(),
        });
        self.running.lock().unwrap().push(Arc::clone(&op));
        op
    }

    fn unregister(&self, id: u64) {
        self.running.lock().unwrap().retain(|op| op.id != id);
    }

    /// Schedules at most one background compaction for `table`. Returns
    /// whether one was submitted.
    pub fn submit_background(self: &Arc<Self>, table: &Arc<TableStore>) -> Result<bool> {
        if self.is_paused() || !table.strategy().is_active() {
            return Ok(false);
        }
        {
            let running = self.running.lock().unwrap();
            if running
                .iter()
                .any(|op| op.table == table.id() && op.kind == OperationKind::Compaction)
            {
                return Ok(false);
            }
        }

        let view = table.tracker().view();
        let schema = table.schema();
        let now_seconds = (crate::sstable::format::wall_clock_millis() / 1000) as u32;
        let Some(inputs) = table.strategy().select_compaction(
            &view,
            schema.params.min_compaction_threshold,
            schema.params.max_compaction_threshold,
            now_seconds,
        ) else {
            return Ok(false);
        };

        let generations: Vec<u64> = inputs.iter().map(SsTable::generation).collect();
        if !table.tracker().try_mark_compacting(&generations) {
            return Ok(false);
        }

        let manager = Arc::clone(self);
        let task_table = Arc::clone(table);
        let submitted = self.executor.submit(move || {
            manager.run_compaction(&task_table, inputs, false)
        });
        match submitted {
            Ok(_) => Ok(true),
            Err(e) => {
                table.tracker().unmark_compacting(&generations);
                Err(e)
            }
        }
    }

    /// Runs a single major compaction over every live file, optionally
    /// splitting the output by the table's shard boundaries. Synchronous.
    pub fn perform_maximal(self: &Arc<Self>, table: &Arc<TableStore>, split: bool) -> Result<()> {
        let view = table.tracker().view();
        let inputs: Vec<SsTable> = view
            .live
            .iter()
            .filter(|t| !view.compacting.contains(&t.generation()))
            .cloned()
            .collect();
        if inputs.len() < 2 && !split {
            return Ok(());
        }
        let generations: Vec<u64> = inputs.iter().map(SsTable::generation).collect();
        if !table.tracker().try_mark_compacting(&generations) {
            return Err(Error::InvalidRequest(
                "live files are already being compacted".to_string(),
            ));
        }
        self.run_compaction(table, inputs, split)
    }

    /// Compacts exactly the given generations.
    pub fn force_user_defined(
        self: &Arc<Self>,
        table: &Arc<TableStore>,
        generations: &[u64],
    ) -> Result<()> {
        let view = table.tracker().view();
        let inputs: Vec<SsTable> = view
            .live
            .iter()
            .filter(|t| generations.contains(&t.generation()))
            .cloned()
            .collect();
        if inputs.len() != generations.len() {
            return Err(Error::InvalidRequest(
                "some requested generations are not live".to_string(),
            ));
        }
        if !table.tracker().try_mark_compacting(generations) {
            return Err(Error::InvalidRequest(
                "requested generations are already being compacted".to_string(),
            ));
        }
        self.run_compaction(table, inputs, false)
    }

    /// Sets the stop flag on operations of the given tables whose inputs
    /// match `predicate`. Validation operations are spared unless
    /// `interrupt_validation` is set.
    pub fn interrupt_for(
        &self,
        tables: &[TableId],
        predicate: impl Fn(&[u64]) -> bool,
        interrupt_validation: bool,
        trigger: StopTrigger,
    ) {
        for op in self.running.lock().unwrap().iter() {
            if !tables.contains(&op.table) {
                continue;
            }
            if op.kind == OperationKind::Validation && !interrupt_validation {
                continue;
            }
            if predicate(&op.inputs) {
                tracing::info!(op = op.id, table = %op.table, ?trigger, "interrupting compaction");
                op.stop.request(trigger);
            }
        }
    }

    /// Blocks until every matching operation has unregistered.
    pub fn wait_for_cessation(&self, tables: &[TableId], predicate: impl Fn(&[u64]) -> bool) {
        loop {
            let any_running = self
                .running
                .lock()
                .unwrap()
                .iter()
                .any(|op| tables.contains(&op.table) && predicate(&op.inputs));
            if !any_running {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Pauses globally, interrupts everything touching `table`, waits for
    /// cessation, then runs `f`. Truncate and drop run inside this.
    pub fn run_with_compactions_disabled<T>(
        self: &Arc<Self>,
        table: &Arc<TableStore>,
        trigger: StopTrigger,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let _pauser = self.pause_global();
        self.interrupt_for(&[table.id()], |_| true, true, trigger);
        self.wait_for_cessation(&[table.id()], |_| true);
        f()
    }

    /// Interrupts everything; called once at engine shutdown.
    pub fn shutdown(&self) {
        for op in self.running.lock().unwrap().iter() {
            op.stop.request(StopTrigger::Shutdown);
        }
    }

    fn run_compaction(
        self: &Arc<Self>,
        table: &Arc<TableStore>,
        inputs: Vec<SsTable>,
        split: bool,
    ) -> Result<()> {
        let generations: Vec<u64> = inputs.iter().map(SsTable::generation).collect();
        let op = self.register(table.id(), OperationKind::Compaction, generations.clone());
        let result = self.run_compaction_inner(table, &inputs, &op, split);
        self.unregister(op.id);

        match result {
            Ok(stats) => {
                tracing::info!(
                    table = %table.schema().qualified_name(),
                    inputs = generations.len(),
                    partitions_in = stats.partitions_in,
                    partitions_out = stats.partitions_out,
                    tombstones_purged = stats.tombstones_purged,
                    "compaction finished"
                );
                Ok(())
            }
            Err(e) => {
                table.tracker().unmark_compacting(&generations);
                if matches!(e, Error::Corrupt(_)) && table.is_index() {
                    tracing::warn!(
                        table = %table.schema().qualified_name(),
                        error = %e,
                        "index compaction hit corruption; rebuilding from base table"
                    );
                    return table.rebuild_index_from_base();
                }
                tracing::error!(
                    table = %table.schema().qualified_name(),
                    error = %e,
                    "compaction failed; inputs stay live"
                );
                Err(e)
            }
        }
    }

    fn run_compaction_inner(
        &self,
        table: &Arc<TableStore>,
        inputs: &[SsTable],
        op: &OperationState,
        split: bool,
    ) -> Result<MergeStats> {
        let directories = table.directories();
        let schema = table.schema();
        let now_seconds = (crate::sstable::format::wall_clock_millis() / 1000) as u32;
        let controller =
            purge_controller(table, inputs, now_seconds, schema.params.gc_grace.as_secs());

        let mut txn = LifecycleTransaction::new(
            Arc::clone(table.tracker()),
            OperationType::Compaction,
            &directories[0],
            inputs.to_vec(),
            schema.params.crc_check_chance,
        );

        let shard_bounds: Vec<KeyBounds> = if split {
            token_shard_bounds(&table.shard_boundaries(directories.len()))
        } else {
            vec![(Bound::Unbounded, Bound::Unbounded)]
        };

        let mut total = MergeStats::default();
        for (shard, bounds) in shard_bounds.into_iter().enumerate() {
            let dir = &directories[shard % directories.len()];
            let descriptor =
                Descriptor::new(dir.clone(), SsTableFormat::Flat, table.next_generation());
            let expected: usize = inputs.iter().map(|t| t.stats().entry_count as usize).sum();
            let mut writer = FlatWriter::create(descriptor.clone(), expected)?;
            let stats = merge::merge_sstables(inputs, bounds, &mut writer, &controller, &op.stop)?;

            if writer.entry_count() == 0 {
                drop(writer);
                delete_components(&descriptor);
            } else {
                writer.finish(UNREPAIRED, None)?;
                txn.track_new(descriptor);
            }
            total.partitions_in += stats.partitions_in;
            total.partitions_out += stats.partitions_out;
            total.tombstones_purged += stats.tombstones_purged;
        }

        txn.prepare_to_commit()?;
        let outputs = txn.commit()?;
        let added: Vec<u64> = outputs.iter().map(SsTable::generation).collect();
        let removed: Vec<u64> = inputs.iter().map(SsTable::generation).collect();
        table.strategy().replaced(&removed, &added);
        table
            .metrics()
            .record_compaction(outputs.iter().map(|t| t.stats().data_size).sum());
        Ok(total)
    }
}

/// Guard returned by `pause_global`; dropping it resumes compactions.
pub struct CompactionPauser {
    manager: Arc<CompactionManager>,
}

impl Drop for CompactionPauser {
    fn drop(&mut self) {
        self.manager.pause_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Computes how aggressively tombstones may be purged: the smallest
/// timestamp in any overlapping live file outside the compaction bounds
/// what a tombstone may still shadow.
fn purge_controller(
    table: &Arc<TableStore>,
    inputs: &[SsTable],
    now_seconds: u32,
    gc_grace_seconds: u64,
) -> PurgeController {
    let input_generations: Vec<u64> = inputs.iter().map(SsTable::generation).collect();
    let lower = inputs.iter().map(|t| t.stats().first_key.clone()).min();
    let upper = inputs.iter().map(|t| t.stats().last_key.clone()).max();
    let (Some(lower), Some(upper)) = (lower, upper) else {
        return PurgeController::conservative(now_seconds);
    };
    let bounds: KeyBounds = (Bound::Included(lower), Bound::Included(upper));

    let view = table.tracker().view();
    let min_other_timestamp = view
        .live
        .iter()
        .filter(|t| !input_generations.contains(&t.generation()))
        .filter(|t| t.intersects(&bounds))
        .map(|t| t.stats().min_timestamp)
        .min()
        .unwrap_or(Timestamp::MAX);

    PurgeController {
        now_seconds,
        gc_grace_seconds,
        min_other_timestamp,
    }
}

/// Token boundaries to partition-key bounds: an empty key at a token sorts
/// before every real key with that token.
fn token_shard_bounds(boundaries: &[crate::partition::key::Token]) -> Vec<KeyBounds> {
    if boundaries.is_empty() {
        return vec![(Bound::Unbounded, Bound::Unbounded)];
    }
    let key_at = |t: &crate::partition::key::Token| PartitionKey::from_parts(*t, Vec::new());
    let mut bounds = Vec::with_capacity(boundaries.len() + 1);
    bounds.push((Bound::Unbounded, Bound::Excluded(key_at(&boundaries[0]))));
    for pair in boundaries.windows(2) {
        bounds.push((
            Bound::Included(key_at(&pair[0])),
            Bound::Excluded(key_at(&pair[1])),
        ));
    }
    bounds.push((
        Bound::Included(key_at(boundaries.last().unwrap())),
        Bound::Unbounded,
    ));
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_trigger_round_trip() {
        for trigger in [
            StopTrigger::None,
            StopTrigger::Compaction,
            StopTrigger::Cleanup,
            StopTrigger::Truncate,
            StopTrigger::Shutdown,
            StopTrigger::UnitTests,
        ] {
            assert_eq!(StopTrigger::from_u8(trigger.as_u8()), trigger);
        }
    }

    #[test]
    fn test_stop_signal() {
        let signal = StopSignal::new();
        assert_eq!(signal.get(), StopTrigger::None);
        signal.request(StopTrigger::Truncate);
        assert_eq!(signal.get(), StopTrigger::Truncate);
    }

    #[test]
    fn test_token_shard_bounds() {
        use crate::partition::key::Token;
        let bounds = token_shard_bounds(&[Token(0)]);
        assert_eq!(bounds.len(), 2);
        let all = token_shard_bounds(&[]);
        assert_eq!(all.len(), 1);
    }
}
