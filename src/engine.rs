//! Engine assembly.
//!
//! Everything the original system reached for through process-wide
//! singletons (commit log, compaction manager, cache service, worker
//! pools) is a field of [`EngineContext`], built once and passed to every
//! table store. Unit tests substitute the in-memory commit log; a
//! deployment passes its own log writer.

use std::sync::Arc;

use crate::commitlog::{CommitLog, MemoryLog};
use crate::compaction::CompactionManager;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::executor::Executors;
use crate::flock::FileLock;
use crate::flush::FlushReason;
use crate::partition::mutation::Mutation;
use crate::cache::RowCache;
use crate::schema::{Schema, TableId, TableSchema};
use crate::table::TableStore;

const ROW_CACHE_PARTITIONS: usize = 4096;

/// The explicit-dependency aggregate shared by every table store.
pub struct EngineContext {
    pub config: EngineConfig,
    pub log: Arc<dyn CommitLog>,
    memory_log: Option<Arc<MemoryLog>>,
    pub schema: Arc<Schema>,
    pub compaction: Arc<CompactionManager>,
    pub row_cache: Arc<RowCache>,
    pub executors: Executors,
}

impl EngineContext {
    /// Context backed by the in-process commit log.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let memory_log = Arc::new(MemoryLog::new());
        Self::build(config, Arc::clone(&memory_log) as Arc<dyn CommitLog>, Some(memory_log))
    }

    /// Context driven by an external commit-log writer.
    pub fn with_log(config: EngineConfig, log: Arc<dyn CommitLog>) -> Arc<Self> {
        Self::build(config, log, None)
    }

    fn build(
        config: EngineConfig,
        log: Arc<dyn CommitLog>,
        memory_log: Option<Arc<MemoryLog>>,
    ) -> Arc<Self> {
        let executors = Executors::new(
            config.data_dirs.len(),
            config.flush_writers,
            config.compaction_workers,
            config.executor_queue_depth,
        );
        let compaction = Arc::new(CompactionManager::new(Arc::clone(&executors.compaction)));
        Arc::new(Self {
            config,
            log,
            memory_log,
            schema: Arc::new(Schema::new()),
            compaction,
            row_cache: Arc::new(RowCache::new(ROW_CACHE_PARTITIONS)),
            executors,
        })
    }

    /// The embedded log, when this context owns one. Lets the write path
    /// advance positions and tests observe discards.
    pub fn memory_log(&self) -> Option<&Arc<MemoryLog>> {
        self.memory_log.as_ref()
    }
}

/// The storage engine: a schema namespace of table stores over a shared
/// context, with exclusive locks on its data directories.
pub struct Engine {
    ctx: Arc<EngineContext>,
    _locks: Vec<FileLock>,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Engine> {
        config.validate()?;
        let locks = lock_dirs(&config)?;
        Ok(Engine {
            ctx: EngineContext::new(config),
            _locks: locks,
        })
    }

    pub fn open_with_log(config: EngineConfig, log: Arc<dyn CommitLog>) -> Result<Engine> {
        config.validate()?;
        let locks = lock_dirs(&config)?;
        Ok(Engine {
            ctx: EngineContext::with_log(config, log),
            _locks: locks,
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Creates (or reopens) a table and its index tables, registering all
    /// of them in the schema namespace.
    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<TableStore>> {
        let base_id = schema.id;
        for def in &schema.indexes {
            let hidden = TableSchema::new(
                schema.keyspace.clone(),
                format!("{}.{}", schema.name, def.name),
                def.index_table,
            )
            .column(0, "entry");
            let index = TableStore::open(Arc::clone(&self.ctx), hidden, Some(base_id))?;
            self.ctx.schema.register(index);
        }
        let table = TableStore::open(Arc::clone(&self.ctx), schema, None)?;
        self.ctx.schema.register(Arc::clone(&table));
        Ok(table)
    }

    pub fn table(&self, id: TableId) -> Option<Arc<TableStore>> {
        self.ctx.schema.table(id)
    }

    /// Applies a mutation to every table it names. The mutation is recorded
    /// in the embedded commit log first when any target is durable.
    pub fn apply(&self, mutation: &Mutation) -> Result<()> {
        if mutation.is_empty() {
            return Err(Error::InvalidRequest("empty mutation".to_string()));
        }
        // Resolve every target before touching any state.
        let mut targets = Vec::new();
        for id in mutation.table_ids() {
            let table = self
                .ctx
                .schema
                .table(id)
                .ok_or_else(|| Error::InvalidRequest(format!("unknown table {id}")))?;
            targets.push(table);
        }

        let durable = targets
            .iter()
            .any(|t| t.schema().params.durable_writes);
        if durable {
            if let Some(log) = self.ctx.memory_log() {
                log.append(mutation.serialized_size() as u32);
            }
        }

        for table in &targets {
            table.apply(mutation)?;
        }
        Ok(())
    }

    /// Drops a table: flush, optional snapshot, obsolete its files, and
    /// remove it from the namespace.
    pub fn drop_table(&self, id: TableId, snapshot: bool) -> Result<()> {
        let table = self
            .ctx
            .schema
            .table(id)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown table {id}")))?;

        table.flush(FlushReason::Drop)?.wait()?;
        if snapshot {
            table.snapshot(
                &format!("dropped-{}", crate::sstable::format::wall_clock_millis()),
                false,
            )?;
        }
        table.invalidate();
        let dropped = table.tracker().drop_sstables(|_| true);
        for sstable in &dropped {
            sstable.mark_obsolete();
        }
        self.ctx.schema.unregister(id);
        tracing::info!(table = %id, "table dropped");
        Ok(())
    }

    pub fn flush_all(&self, reason: FlushReason) -> Result<()> {
        for table in self.ctx.schema.tables() {
            if !table.is_index() {
                table.flush(reason)?.wait()?;
            }
        }
        Ok(())
    }

    /// Flushes everything and stops background work. The engine is not
    /// usable afterwards.
    pub fn shutdown(self) -> Result<()> {
        self.flush_all(FlushReason::Shutdown)?;
        self.ctx.compaction.shutdown();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Table stores keep the context alive; dropping the registry lets
        // the context (and its executors) wind down with the engine.
        self.ctx.compaction.shutdown();
        self.ctx.schema.clear();
    }
}

fn lock_dirs(config: &EngineConfig) -> Result<Vec<FileLock>> {
    config
        .data_dirs
        .iter()
        .map(|dir| {
            std::fs::create_dir_all(dir).map_err(crate::error::write_err)?;
            FileLock::lock(dir.join("tephra.lock"))
        })
        .collect()
}
