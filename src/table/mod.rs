//! The table store: composition root for one table's storage.
//!
//! Owns the memtable lifecycle, the tracker, the compaction strategy slot,
//! per-table metrics, secondary-index plumbing, snapshots, and truncation.
//! Everything process-wide (commit log, compaction manager, row cache,
//! executors, schema namespace) arrives through the engine context instead
//! of being reached for globally.

pub mod index;
pub mod snapshot;
pub mod truncate;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::commitlog::{CommitLog, ReplayPosition};
use crate::engine::EngineContext;
use crate::error::{Error, Result};
use crate::flush::{flush_table, FlushHandle, FlushReason};
use crate::lifecycle;
use crate::memtable::{Indexer, LogPositionBound, Memtable, NoopIndexer};
use crate::metrics::TableMetrics;
use crate::oporder::OpOrder;
use crate::partition::key::{HashPartitioner, PartitionKey, Partitioner, Token};
use crate::partition::mutation::Mutation;
use crate::partition::update::PartitionUpdate;
use crate::read::{
    CacheContext, PartitionIterator, ReadCommand, ReadPartition, Source,
};
use crate::schema::{TableId, TableSchema};
use crate::sstable::{Descriptor, SsTable};
use crate::tracker::Tracker;

pub use index::TableIndexer;
pub use snapshot::SnapshotManifest;

const TRUNCATION_RECORD: &str = "truncated.bin";

/// Persisted across restarts so commit-log replay skips everything at or
/// below the truncation point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TruncationRecord {
    pub position: ReplayPosition,
    pub truncated_at: i64,
}

pub struct TableStore {
    schema: RwLock<Arc<TableSchema>>,
    ctx: Arc<EngineContext>,
    tracker: Arc<Tracker>,
    partitioner: Arc<dyn Partitioner>,
    directories: Vec<PathBuf>,
    write_order: OpOrder,
    read_order: OpOrder,
    flush_monitor: Mutex<()>,
    next_generation: AtomicU64,
    metrics: TableMetrics,
    strategy: crate::compaction::StrategySlot,
    /// Highest commit-log position made durable by a completed flush.
    flushed_position: RwLock<Option<ReplayPosition>>,
    last_flush_at: RwLock<Instant>,
    truncation: RwLock<Option<TruncationRecord>>,
    shard_cache: Mutex<Option<(usize, Vec<Token>)>>,
    /// Base table id when this store holds a secondary index.
    base: Option<TableId>,
    pub(crate) truncating: AtomicBool,
    valid: AtomicBool,
}

impl TableStore {
    /// Opens (or creates) the table's directories, resolves any pending
    /// lifecycle transactions, and loads the surviving sorted files.
    pub fn open(
        ctx: Arc<EngineContext>,
        schema: TableSchema,
        base: Option<TableId>,
    ) -> Result<Arc<TableStore>> {
        schema.params.validate()?;
        let schema = Arc::new(schema);

        let directories: Vec<PathBuf> = ctx
            .config
            .data_dirs
            .iter()
            .map(|d| d.join(&schema.keyspace).join(schema.dir_component()))
            .collect();
        for dir in &directories {
            std::fs::create_dir_all(dir).map_err(crate::error::write_err)?;
            lifecycle::recover_directory(dir)?;
            snapshot::clear_ephemeral_snapshots(dir)?;
        }

        let mut live = Vec::new();
        let mut max_generation = 0;
        for dir in &directories {
            for descriptor in Descriptor::discover(dir)? {
                max_generation = max_generation.max(descriptor.generation);
                live.push(SsTable::open(descriptor, schema.params.crc_check_chance)?);
            }
        }

        let truncation = load_truncation_record(&directories[0])?;
        let memtable = Arc::new(Memtable::new(
            Arc::clone(&schema),
            Arc::new(LogPositionBound::new(ctx.log.current_position())),
            ctx.config.memtable_soft_limit,
        ));
        let tracker = Arc::new(Tracker::new(memtable));
        // Telemetry observer: a plain callback holding the table name, not
        // a reference back into the store.
        tracker.subscribe(Box::new({
            let name = schema.qualified_name();
            move |notification| {
                tracing::trace!(table = %name, ?notification, "tracker transition");
            }
        }));
        if !live.is_empty() {
            tracing::info!(
                table = %schema.qualified_name(),
                files = live.len(),
                "opened table with existing sorted files"
            );
            tracker.add_sstables(live);
        }

        let name = schema.qualified_name();
        Ok(Arc::new(TableStore {
            schema: RwLock::new(schema),
            ctx,
            tracker,
            partitioner: Arc::new(HashPartitioner),
            directories,
            write_order: OpOrder::new(),
            read_order: OpOrder::new(),
            flush_monitor: Mutex::new(()),
            next_generation: AtomicU64::new(max_generation + 1),
            metrics: TableMetrics::new(name),
            strategy: crate::compaction::StrategySlot::default(),
            flushed_position: RwLock::new(None),
            last_flush_at: RwLock::new(Instant::now()),
            truncation: RwLock::new(truncation),
            shard_cache: Mutex::new(None),
            base,
            truncating: AtomicBool::new(false),
            valid: AtomicBool::new(true),
        }))
    }

    pub fn id(&self) -> TableId {
        self.schema().id
    }

    pub fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema.read().unwrap())
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn log(&self) -> &Arc<dyn CommitLog> {
        &self.ctx.log
    }

    pub fn write_order(&self) -> &OpOrder {
        &self.write_order
    }

    pub fn read_order(&self) -> &OpOrder {
        &self.read_order
    }

    pub fn flush_monitor(&self) -> &Mutex<()> {
        &self.flush_monitor
    }

    pub fn metrics(&self) -> &TableMetrics {
        &self.metrics
    }

    pub fn strategy(&self) -> &crate::compaction::StrategySlot {
        &self.strategy
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.directories.clone()
    }

    pub fn partitioner(&self) -> &Arc<dyn Partitioner> {
        &self.partitioner
    }

    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    pub fn new_memtable(&self) -> Arc<Memtable> {
        self.memtable_with_lower(Arc::new(LogPositionBound::new(
            self.ctx.log.current_position(),
        )))
    }

    /// Replacement memtable whose log coverage starts at `lower`. The flush
    /// pipeline passes the outgoing memtable's upper-bound cell, so the two
    /// are contiguous in the log.
    pub fn memtable_with_lower(&self, lower: Arc<LogPositionBound>) -> Arc<Memtable> {
        Arc::new(Memtable::new(
            self.schema(),
            lower,
            self.ctx.config.memtable_soft_limit,
        ))
    }

    pub fn is_index(&self) -> bool {
        self.base.is_some()
    }

    pub fn base_table(&self) -> Option<Arc<TableStore>> {
        self.base.and_then(|id| self.ctx.schema.table(id))
    }

    /// The hidden tables holding this table's secondary indexes.
    pub fn index_tables(&self) -> Vec<Arc<TableStore>> {
        self.schema()
            .indexes
            .iter()
            .filter_map(|def| self.ctx.schema.table(def.index_table))
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Token boundaries splitting local ownership into `shard_count`
    /// weighted-equal ranges. Cached; invalidated when the ring changes.
    pub fn shard_boundaries(&self, shard_count: usize) -> Vec<Token> {
        let mut cache = self.shard_cache.lock().unwrap();
        if let Some((count, boundaries)) = cache.as_ref() {
            if *count == shard_count {
                return boundaries.clone();
            }
        }
        let boundaries = self
            .partitioner
            .split_evenly(shard_count)
            .unwrap_or_default();
        *cache = Some((shard_count, boundaries.clone()));
        boundaries
    }

    /// Drops the cached shard split; called when ring ownership changes.
    pub fn invalidate_shard_boundaries(&self) {
        *self.shard_cache.lock().unwrap() = None;
    }

    pub fn decorate_key(&self, raw: Vec<u8>) -> PartitionKey {
        PartitionKey::new(self.partitioner.as_ref(), raw)
    }

    // ---- write path ----

    /// Applies this table's slice of a mutation.
    pub fn apply(self: &Arc<Self>, mutation: &Mutation) -> Result<()> {
        let update = mutation.update_for(self.id()).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "mutation carries no update for table {}",
                self.id()
            ))
        })?;
        self.apply_update(update)
    }

    /// Merges one partition update into the current memtable, retrying
    /// across memtable switches. Writers stall here when a blocking flush
    /// barrier is pending and the memtable is over its soft limit.
    pub fn apply_update(self: &Arc<Self>, update: &PartitionUpdate) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::InvalidRequest(format!(
                "table {} has been invalidated",
                self.id()
            )));
        }
        if update.table_id() != self.id() {
            return Err(Error::InvalidRequest(format!(
                "update targets table {}, not {}",
                update.table_id(),
                self.id()
            )));
        }

        let schema = self.schema();
        let indexer: Box<dyn Indexer> = if schema.indexes.is_empty() {
            Box::new(NoopIndexer)
        } else {
            Box::new(TableIndexer::new(self))
        };

        loop {
            let view = self.tracker.view();
            let memtable = Arc::clone(&view.current);

            if memtable.over_soft_limit() {
                // Ask for a flush, then stall while the flusher is draining
                // writers and memory is still over the limit.
                let _ = self.flush(FlushReason::MemtableLimit);
                let tracker = Arc::clone(&self.tracker);
                self.write_order
                    .stall_while_blocking(move || tracker.view().current.over_soft_limit());
                if !Arc::ptr_eq(&self.tracker.view().current, &memtable) {
                    continue;
                }
            }

            let group = self.write_order.start();
            match memtable.put(update, indexer.as_ref(), &group) {
                Some(delta) => {
                    drop(group);
                    self.metrics.record_write(delta.timestamp_delta);
                    self.ctx.row_cache.invalidate(self.id(), update.key());
                    return Ok(());
                }
                None => {
                    // Switched out underneath us; retry on the new one.
                    drop(group);
                    continue;
                }
            }
        }
    }

    // ---- read path ----

    /// Builds the merged partition iterator for a read command.
    pub fn read(self: &Arc<Self>, cmd: ReadCommand) -> Result<PartitionIterator> {
        if cmd.table != self.id() {
            return Err(Error::InvalidRequest(format!(
                "read targets table {}, not {}",
                cmd.table,
                self.id()
            )));
        }
        let started = Instant::now();
        let group = self.read_order.start();
        let view = self.tracker.view();
        let bounds = cmd.selection.bounds();

        let mut sources = Vec::new();
        for memtable in view.memtables() {
            sources.push(Source::from_memtable(memtable, bounds.clone()));
        }
        for sstable in view.sstables_in(&bounds) {
            // A failing scanner closes the ones already built: they drop
            // with `sources` on the error return.
            sources.push(Source::from_sstable(&sstable, bounds.clone())?);
        }

        let cache = self.cache_context();
        self.metrics.record_read(started.elapsed());
        Ok(PartitionIterator::new(sources, cmd, cache)
            .pinned(Box::new(view))
            .pinned(Box::new(group)))
    }

    /// Point read: per-source lookups short-circuit the merge.
    pub fn get(self: &Arc<Self>, cmd: &ReadCommand) -> Result<Option<ReadPartition>> {
        let crate::read::PartitionSelection::Key(key) = &cmd.selection else {
            return Err(Error::InvalidRequest(
                "point read requires a key selection".to_string(),
            ));
        };
        let started = Instant::now();
        let _group = self.read_order.start();
        let view = self.tracker.view();

        // Cache cover check first.
        let schema = self.schema();
        if schema.params.rows_per_partition_to_cache > 0 && cmd.clustering_filter.is_head() {
            if let Some(cached) = self.ctx.row_cache.get(self.id(), key) {
                let covered = if cmd.limits.row_limit == usize::MAX {
                    cached.complete
                } else {
                    cached.covers_head(cmd.limits.row_limit)
                };
                if covered {
                    let rows: Vec<_> = cached
                        .rows
                        .iter()
                        .filter(|r| cmd.clustering_filter.selects(&r.clustering))
                        .take(cmd.limits.row_limit)
                        .cloned()
                        .collect();
                    self.metrics.record_read(started.elapsed());
                    return Ok(if rows.is_empty() {
                        None
                    } else {
                        Some(ReadPartition {
                            key: key.clone(),
                            rows,
                        })
                    });
                }
            }
        }

        let mut states = Vec::new();
        for memtable in view.memtables() {
            if let Some(state) = memtable.get(key) {
                states.push(state);
            }
        }
        let point_bounds = cmd.selection.bounds();
        for sstable in view.sstables_in(&point_bounds) {
            if let Some(state) = sstable.get(key)? {
                states.push(state);
            }
        }

        let result = crate::read::reconcile_point(states, cmd);
        self.metrics.record_read(started.elapsed());
        Ok(result)
    }

    fn cache_context(&self) -> Option<CacheContext> {
        let schema = self.schema();
        if schema.params.rows_per_partition_to_cache == 0 {
            return None;
        }
        Some(CacheContext {
            cache: Arc::clone(&self.ctx.row_cache),
            table: schema.id,
            rows_to_cache: schema.params.rows_per_partition_to_cache,
        })
    }

    // ---- flush plumbing ----

    pub fn flush(self: &Arc<Self>, reason: FlushReason) -> Result<FlushHandle> {
        flush_table(self, reason)
    }

    pub(crate) fn publish_flushed(&self, position: ReplayPosition) {
        let mut flushed = self.flushed_position.write().unwrap();
        if flushed.map_or(true, |p| position > p) {
            *flushed = Some(position);
        }
        *self.last_flush_at.write().unwrap() = Instant::now();
    }

    pub fn flushed_position(&self) -> Option<ReplayPosition> {
        *self.flushed_position.read().unwrap()
    }

    /// Whether the periodic flusher should fire for this table.
    pub fn flush_period_expired(&self) -> bool {
        let period = self.schema().params.memtable_flush_period;
        if period.is_zero() {
            return false;
        }
        self.last_flush_at.read().unwrap().elapsed() >= period
    }

    pub(crate) fn strategy_created(&self, produced: &[SsTable]) {
        for table in produced {
            self.strategy.created_sstable(table.generation());
        }
    }

    // ---- lifecycle ----

    /// Records the truncation point durably; replay after restart starts
    /// strictly above it.
    pub(crate) fn record_truncation(&self, record: TruncationRecord) -> Result<()> {
        let path = self.directories[0].join(TRUNCATION_RECORD);
        let bytes = bincode::serialize(&record)?;
        std::fs::write(&path, bytes).map_err(crate::error::write_err)?;
        *self.truncation.write().unwrap() = Some(record);
        self.tracker.notify_truncated(record.truncated_at);
        Ok(())
    }

    pub fn truncation_record(&self) -> Option<TruncationRecord> {
        *self.truncation.read().unwrap()
    }

    /// Rebuilds this index table from its base table's full content. Used
    /// when index compaction hits corruption.
    pub fn rebuild_index_from_base(self: &Arc<Self>) -> Result<()> {
        let base = self.base_table().ok_or_else(|| {
            Error::InvalidRequest("not an index table, nothing to rebuild from".to_string())
        })?;
        index::rebuild(&base, self)
    }

    /// Invalidates the table: pending compactions are interrupted, caches
    /// dropped, further writes refused. Files stay on disk.
    pub fn invalidate(self: &Arc<Self>) {
        self.valid.store(false, Ordering::SeqCst);
        self.ctx.compaction.interrupt_for(
            &[self.id()],
            |_| true,
            true,
            crate::compaction::StopTrigger::Shutdown,
        );
        self.ctx.row_cache.invalidate_table(self.id());
        tracing::info!(table = %self.schema().qualified_name(), "table invalidated");
    }

    /// Swaps in new table parameters (schema reload).
    pub fn reload(&self, schema: TableSchema) -> Result<()> {
        schema.params.validate()?;
        if schema.id != self.id() {
            return Err(Error::InvalidRequest(
                "reload must keep the table id".to_string(),
            ));
        }
        *self.schema.write().unwrap() = Arc::new(schema);
        self.invalidate_shard_boundaries();
        Ok(())
    }
}

fn load_truncation_record(dir: &std::path::Path) -> Result<Option<TruncationRecord>> {
    let path = dir.join(TRUNCATION_RECORD);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path)?;
    Ok(Some(bincode::deserialize(&bytes)?))
}
