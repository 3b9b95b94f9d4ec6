//! The flush pipeline: memtable to sorted files.
//!
//! A flush switches the current memtable (and the memtables of every
//! attached index table) behind a write barrier, drains the barrier, writes
//! one sorted file per data-directory shard in parallel, and commits the
//! swap through a lifecycle transaction. Post-flush bookkeeping runs on a
//! single-threaded executor, so completion order equals submission order
//! and the commit log's discard point only ever moves forward.
//!
//! Failure leaves the memtable in the flushing slot and the commit log
//! untouched, so a retry can pick it up; the lifecycle transaction deletes
//! any partial output.

use std::ops::Bound;
use std::sync::Arc;

use crossbeam_channel::bounded;

use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleTransaction, OperationType};
use crate::memtable::{LogPositionBound, Memtable};
use crate::partition::key::Token;
use crate::sstable::{Descriptor, FlatWriter, SsTableFormat, UNREPAIRED};
use crate::table::TableStore;

/// Why a flush was requested. The trigger carries no behavioral weight on
/// its own; `Memtable::should_switch` decides whether it takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    CommitLogDirty,
    MemtableLimit,
    MemtablePeriodExpired,
    IndexBuildStarted,
    IndexBuildCompleted,
    IndexRemoved,
    IndexTableFlush,
    ViewBuildStarted,
    InternallyForced,
    UserForced,
    Startup,
    Shutdown,
    Snapshot,
    Truncate,
    Drop,
    Streaming,
    StreamsReceived,
    Repair,
    SchemaChange,
    UnitTests,
}

/// Completion handle for a flush. Completion of a later handle implies
/// completion of every earlier flush of the same table.
pub struct FlushHandle {
    inner: crate::executor::TaskHandle<()>,
}

impl FlushHandle {
    pub fn wait(self) -> Result<()> {
        self.inner.wait()
    }

    pub fn try_wait(&self) -> Option<Result<()>> {
        self.inner.try_wait()
    }
}

/// Requests a flush of `table`'s current memtable.
///
/// Under the table's flush monitor: consult `should_switch`; a declined
/// switch returns a handle that completes once every previously submitted
/// flush has (the "wait for flushes" path). Otherwise the memtable and all
/// index memtables are switched behind a fresh write barrier and the flush
/// plus its post-flush task are submitted.
pub fn flush_table(table: &Arc<TableStore>, reason: FlushReason) -> Result<FlushHandle> {
    let ctx = table.context();
    let _monitor = table.flush_monitor().lock().unwrap();

    let current = table.tracker().view().current.clone();
    if !current.should_switch(reason) {
        tracing::debug!(table = %table.schema().qualified_name(), ?reason, "flush declined; waiting for prior flushes");
        let handle = ctx.executors.post_flush.submit(|| Ok(()))?;
        return Ok(FlushHandle { inner: handle });
    }

    // The shared upper bound every switched memtable latches. Advanced (only
    // forward) after the swap so it covers every position writers saw.
    let upper_bound = Arc::new(LogPositionBound::new(table.log().current_position()));
    let mut barrier = table.write_order().new_barrier();

    let mut frozen: Vec<(Arc<TableStore>, Arc<Memtable>)> = Vec::new();
    for member in std::iter::once(Arc::clone(table)).chain(table.index_tables()) {
        // The replacement's lower bound is the outgoing memtable's upper
        // bound cell: consecutive memtables are contiguous in the log.
        let fresh = member.memtable_with_lower(Arc::clone(&upper_bound));
        let old = member.tracker().switch_memtable(false, fresh);
        old.switch_out(&barrier, Arc::clone(&upper_bound));
        frozen.push((member, old));
    }
    upper_bound.advance_to(table.log().current_position());
    barrier.issue();

    let initial_position = frozen[0].1.initial_log_position();
    let (flush_done_tx, flush_done_rx) = bounded::<Result<()>>(1);

    // Flush runnable: drain the barrier, write every frozen memtable.
    let flush_frozen = frozen.clone();
    ctx.executors.flush.submit(move || {
        barrier.mark_blocking();
        barrier.wait();

        let mut outcome = Ok(());
        for (member, memtable) in &flush_frozen {
            if let Err(e) = flush_one_memtable(member, memtable) {
                tracing::error!(
                    table = %member.schema().qualified_name(),
                    error = %e,
                    "memtable flush failed; memtable stays in the flushing slot"
                );
                outcome = Err(e);
                break;
            }
        }
        let _ = flush_done_tx.send(outcome);
        Ok(())
    })?;

    // Post-flush: strictly ordered. Publishes the durable position and asks
    // the commit log to drop the covered segments, but only on success.
    let post_table = Arc::clone(table);
    let handle = ctx.executors.post_flush.submit(move || {
        let outcome = flush_done_rx
            .recv()
            .unwrap_or_else(|_| Err(Error::FsWrite("flush worker vanished".to_string())));
        match outcome {
            Ok(()) => {
                let upper = upper_bound.get();
                post_table.publish_flushed(upper);
                if post_table.schema().params.durable_writes {
                    post_table.log().discard_completed_segments(
                        post_table.id(),
                        initial_position,
                        upper,
                    );
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    })?;

    Ok(FlushHandle { inner: handle })
}

/// Writes one frozen memtable out as one sorted file per data-directory
/// shard, commits them in a lifecycle transaction, and schedules the
/// memtable reclaim behind a read barrier.
fn flush_one_memtable(table: &Arc<TableStore>, memtable: &Arc<Memtable>) -> Result<()> {
    let ctx = table.context();
    let directories = table.directories();
    let shard_ranges = shard_ranges(&table.shard_boundaries(directories.len()));
    debug_assert_eq!(shard_ranges.len(), directories.len());

    if memtable.is_clean() {
        // Nothing to write; still retire the memtable.
        table.tracker().replace_flushed(memtable, Vec::new());
        schedule_reclaim(table, memtable);
        return Ok(());
    }

    let mut txn = LifecycleTransaction::new(
        Arc::clone(table.tracker()),
        OperationType::Flush,
        &directories[0],
        Vec::new(),
        table.schema().params.crc_check_chance,
    );

    // One write task per shard, on that directory's IO pool. A rejected
    // submission still waits out the shards already in flight, so nothing
    // keeps writing after we report the failure.
    let mut pending = Vec::new();
    let mut failure: Option<Error> = None;
    for (disk, range) in shard_ranges.iter().enumerate() {
        let descriptor = Descriptor::new(
            directories[disk].clone(),
            SsTableFormat::Flat,
            table.next_generation(),
        );
        let memtable = Arc::clone(memtable);
        let range = *range;
        match ctx.executors.per_disk[disk].submit(move || write_shard(descriptor, &memtable, range))
        {
            Ok(task) => pending.push(task),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let mut sealed = Vec::new();
    for task in pending {
        match task.wait() {
            Ok(Some(descriptor)) => sealed.push(descriptor),
            Ok(None) => {}
            Err(e) => failure = Some(failure.take().unwrap_or(e)),
        }
    }
    if let Some(e) = failure {
        // Untracked shards will not be aborted by the transaction; delete
        // them here so a failed flush leaves no stray components.
        for descriptor in sealed {
            crate::sstable::delete_components(&descriptor);
        }
        return Err(e);
    }

    if sealed.is_empty() {
        drop(txn);
        table.tracker().replace_flushed(memtable, Vec::new());
        schedule_reclaim(table, memtable);
        return Ok(());
    }

    for descriptor in sealed {
        txn.track_new(descriptor);
    }
    txn.prepare_to_commit()?;
    let produced = txn.commit_flushed(memtable)?;

    tracing::info!(
        table = %table.schema().qualified_name(),
        files = produced.len(),
        partitions = memtable.partition_count(),
        bytes = memtable.live_bytes(),
        cdc = memtable.is_cdc_dirty(),
        "flushed memtable"
    );
    table.metrics().record_flush(produced.iter().map(|t| t.stats().data_size).sum());
    table.strategy_created(&produced);

    schedule_reclaim(table, memtable);
    Ok(())
}

/// Memtable memory is returned only after in-flight readers finish: a read
/// barrier drains them on the reclaim executor.
fn schedule_reclaim(table: &Arc<TableStore>, memtable: &Arc<Memtable>) {
    let mut read_barrier = table.read_order().new_barrier();
    read_barrier.issue();
    let memtable = Arc::clone(memtable);
    let tracker = Arc::clone(table.tracker());
    let submitted = table.context().executors.reclaim.submit(move || {
        read_barrier.wait();
        memtable.discard();
        tracker.notify_discarded();
        Ok(())
    });
    if let Err(e) = submitted {
        tracing::warn!(error = %e, "reclaim executor rejected memtable discard; memory retained until shutdown");
    }
}

/// Writes the partitions of one token shard. Returns `None` when the shard
/// holds nothing in range.
fn write_shard(
    descriptor: Descriptor,
    memtable: &Memtable,
    range: (Bound<Token>, Bound<Token>),
) -> Result<Option<Descriptor>> {
    // The writer is created lazily so an empty shard never opens a file.
    let mut writer: Option<FlatWriter> = None;
    for update in memtable.flush_set(range) {
        if writer.is_none() {
            writer = Some(FlatWriter::create(
                descriptor.clone(),
                memtable.partition_count(),
            )?);
        }
        writer.as_mut().expect("just created").append(&update)?;
    }
    match writer {
        Some(w) => {
            w.finish(UNREPAIRED, None)?;
            Ok(Some(descriptor))
        }
        None => Ok(None),
    }
}

/// Turns N-1 interior boundaries into N half-open token ranges.
fn shard_ranges(boundaries: &[Token]) -> Vec<(Bound<Token>, Bound<Token>)> {
    if boundaries.is_empty() {
        return vec![(Bound::Unbounded, Bound::Unbounded)];
    }
    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    ranges.push((Bound::Unbounded, Bound::Excluded(boundaries[0])));
    for pair in boundaries.windows(2) {
        ranges.push((Bound::Included(pair[0]), Bound::Excluded(pair[1])));
    }
    ranges.push((
        Bound::Included(*boundaries.last().unwrap()),
        Bound::Unbounded,
    ));
    ranges
}
