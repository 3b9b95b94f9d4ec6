//! Truncation: atomically emptying a table.
//!
//! Runs with compactions disabled and any in-flight compaction of this
//! table interrupted. Memtables are flushed (or dumped when the table is
//! not durable and no snapshot is wanted), a truncation timestamp is
//! taken, every sorted file whose data is entirely older is dropped, the
//! row cache is purged, and the truncation position is recorded durably so
//! commit-log replay after a restart skips the truncated prefix.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::compaction::StopTrigger;
use crate::error::{Error, Result};
use crate::flush::FlushReason;
use crate::sstable::format::wall_clock_millis;

use super::{TableStore, TruncationRecord};

impl TableStore {
    /// Empties the table. `take_snapshot` preserves the pre-truncation
    /// content as a snapshot first.
    pub fn truncate(self: &Arc<Self>, take_snapshot: bool) -> Result<()> {
        if self.truncating.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidRequest(
                "truncation already running".to_string(),
            ));
        }
        let result = self.truncate_inner(take_snapshot);
        self.truncating.store(false, Ordering::SeqCst);
        result
    }

    fn truncate_inner(self: &Arc<Self>, take_snapshot: bool) -> Result<()> {
        let ctx = Arc::clone(self.context());
        let this = Arc::clone(self);
        ctx.compaction
            .run_with_compactions_disabled(self, StopTrigger::Truncate, move || {
                let schema = this.schema();

                if schema.params.durable_writes || take_snapshot {
                    this.flush(FlushReason::Truncate)?.wait()?;
                } else {
                    // Nothing owed to the log: dump the memtables instead of
                    // writing them out.
                    this.tracker().switch_memtable(true, this.new_memtable());
                    let flushing = this.tracker().view().flushing.clone();
                    for memtable in &flushing {
                        this.tracker().replace_flushed(memtable, Vec::new());
                    }
                }

                let truncated_at = wall_clock_millis();
                if take_snapshot {
                    this.snapshot(&format!("truncated-{truncated_at}"), false)?;
                }

                truncate_files(&this, truncated_at);
                for index in this.index_tables() {
                    truncate_files(&index, truncated_at);
                }

                this.context().row_cache.invalidate_table(this.id());
                this.record_truncation(TruncationRecord {
                    position: this.context().log.current_position(),
                    truncated_at,
                })?;

                tracing::info!(
                    table = %schema.qualified_name(),
                    truncated_at,
                    "table truncated"
                );
                Ok(())
            })
    }
}

/// Drops and obsoletes every sorted file whose newest data predates the
/// truncation point.
fn truncate_files(table: &Arc<TableStore>, truncated_at: i64) {
    let dropped = table
        .tracker()
        .drop_sstables(|t| t.stats().max_data_age <= truncated_at);
    for sstable in &dropped {
        sstable.mark_obsolete();
    }
    tracing::debug!(
        table = %table.schema().qualified_name(),
        dropped = dropped.len(),
        "dropped sorted files below truncation point"
    );
}
