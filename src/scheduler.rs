//! Time-driven background work.
//!
//! Four recurring jobs keep a running engine healthy: firing memtable
//! flush periods, offering tables to the compaction manager, logging
//! metrics, and recomputing speculation thresholds. Event-driven work (a
//! flush requested by a write crossing the memory limit) goes straight to
//! the executors and never passes through here.
//!
//! Each registered task runs on its own interval until the scheduler is
//! shut down; a failing tick is logged and the cadence continues. Ticks
//! missed while a slow tick runs are coalesced rather than replayed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::EngineContext;
use crate::error::Result;
use crate::flush::FlushReason;

/// A job the scheduler runs on a fixed cadence.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn execute(&self) -> Result<()>;
}

/// Runs registered tasks until shut down. Must live inside a tokio
/// runtime.
pub struct Scheduler {
    stop: watch::Sender<bool>,
    running: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, task: Arc<dyn BackgroundTask>) -> &Self {
        let name = task.name();
        let mut stopped = self.stop.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.execute().await {
                            tracing::error!(task = task.name(), error = %e, "periodic task failed");
                        }
                    }
                    _ = stopped.changed() => {
                        tracing::info!(task = task.name(), "periodic task stopping");
                        return;
                    }
                }
            }
        });
        self.running.lock().unwrap().push((name, handle));
        self
    }

    /// Signals every task loop and waits for all of them to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.send(true).ok();
        let handles = std::mem::take(&mut *self.running.lock().unwrap());
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                tracing::warn!(task = name, error = %e, "task loop did not exit cleanly");
            }
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers the engine's standing tasks on a scheduler.
pub fn register_engine_tasks(scheduler: &Scheduler, ctx: &Arc<EngineContext>) {
    scheduler
        .register(Arc::new(FlushPeriodTask {
            ctx: Arc::clone(ctx),
        }))
        .register(Arc::new(CompactionCheckTask {
            ctx: Arc::clone(ctx),
        }))
        .register(Arc::new(MetricsTask {
            ctx: Arc::clone(ctx),
        }))
        .register(Arc::new(SpeculationTask {
            ctx: Arc::clone(ctx),
        }));
}

/// Flushes tables whose memtable flush period elapsed.
struct FlushPeriodTask {
    ctx: Arc<EngineContext>,
}

#[async_trait::async_trait]
impl BackgroundTask for FlushPeriodTask {
    fn name(&self) -> &'static str {
        "flush-period"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.scheduler.flush_check_interval
    }

    async fn execute(&self) -> Result<()> {
        for table in self.ctx.schema.tables() {
            if !table.is_index() && table.flush_period_expired() {
                table.flush(FlushReason::MemtablePeriodExpired)?;
            }
        }
        Ok(())
    }
}

/// Offers every table to the compaction manager.
struct CompactionCheckTask {
    ctx: Arc<EngineContext>,
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionCheckTask {
    fn name(&self) -> &'static str {
        "compaction-check"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.scheduler.compaction_interval
    }

    async fn execute(&self) -> Result<()> {
        for table in self.ctx.schema.tables() {
            self.ctx.compaction.submit_background(&table)?;
        }
        Ok(())
    }
}

struct MetricsTask {
    ctx: Arc<EngineContext>,
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.scheduler.metrics_interval
    }

    async fn execute(&self) -> Result<()> {
        for table in self.ctx.schema.tables() {
            table.metrics().log_summary();
        }
        let (hits, misses) = self.ctx.row_cache.stats();
        tracing::info!(hits, misses, "row cache stats");
        Ok(())
    }
}

/// Recomputes speculative-retry thresholds from latency samples.
struct SpeculationTask {
    ctx: Arc<EngineContext>,
}

#[async_trait::async_trait]
impl BackgroundTask for SpeculationTask {
    fn name(&self) -> &'static str {
        "speculation"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.scheduler.speculation_interval
    }

    async fn execute(&self) -> Result<()> {
        for table in self.ctx.schema.tables() {
            let policy = table.schema().params.speculative_retry;
            table.metrics().recompute_speculation(policy);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        ticks: Arc<AtomicUsize>,
        fail_every_other: bool,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self) -> Result<()> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail_every_other && tick % 2 == 1 {
                return Err(crate::error::Error::Timeout("simulated".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ticks_stop_at_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(5),
            ticks: Arc::clone(&ticks),
            fail_every_other: false,
        }));

        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.shutdown().await?;
        let at_shutdown = ticks.load(Ordering::SeqCst);
        assert!(at_shutdown > 1);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), at_shutdown);
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_tick_does_not_kill_the_loop() -> Result<()> {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(5),
            ticks: Arc::clone(&ticks),
            fail_every_other: true,
        }));

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown().await?;
        assert!(
            ticks.load(Ordering::SeqCst) >= 4,
            "loop must keep ticking past failed executions"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_engine_tasks_drive_flush_period() -> Result<()> {
        use crate::config::{EngineConfig, SchedulerConfig, TableParams};
        use crate::schema::{TableId, TableSchema};
        use crate::table::TableStore;
        use crate::testdir::TempDir;

        let dir = TempDir::new()?;
        let config = EngineConfig::new(dir.path()).scheduler(
            SchedulerConfig::default().flush_check_interval(Duration::from_millis(10)),
        );
        let ctx = EngineContext::new(config);
        let schema = TableSchema::new("ks", "t", TableId(1))
            .column(0, "v")
            .params(TableParams::default().memtable_flush_period(Duration::from_millis(20)));
        let table = TableStore::open(Arc::clone(&ctx), schema, None)?;
        ctx.schema.register(Arc::clone(&table));

        // Dirty the memtable so the periodic flush has something to do.
        let key = table.decorate_key(b"k".to_vec());
        let mut update = crate::partition::update::PartitionUpdate::new(TableId(1), key);
        update.add_row(
            crate::partition::update::Row::new(crate::partition::clustering::Clustering::row(
                vec![b"c".to_vec()],
            ))
            .cell(0, crate::partition::update::Cell::live(1, b"v".to_vec())),
        );
        table.apply_update(&update)?;

        let scheduler = Scheduler::new();
        register_engine_tasks(&scheduler, &ctx);

        // Wait until the periodic flush lands.
        for _ in 0..100 {
            if !table.tracker().view().live.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.shutdown().await?;
        assert!(
            !table.tracker().view().live.is_empty(),
            "periodic flush should have produced a sorted file"
        );
        Ok(())
    }
}
