//! Secondary-index maintenance on the single-node write path.
//!
//! An index is a hidden table keyed by the indexed value, with the base
//! partition key as the clustering. The indexer runs inside the base
//! table's put, deriving index entries as updates land; flushes switch the
//! index memtables together with the base memtable, so the two stay
//! aligned on commit-log positions.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::flush::FlushReason;
use crate::memtable::Indexer;
use crate::partition::clustering::Clustering;
use crate::partition::key::PartitionKey;
use crate::partition::update::{Cell, PartitionUpdate, Row, Timestamp};
use crate::read::ReadCommand;

use super::TableStore;

/// Indexer installed on tables that carry index definitions.
pub struct TableIndexer {
    base: Arc<TableStore>,
}

impl TableIndexer {
    pub fn new(base: &Arc<TableStore>) -> Self {
        Self {
            base: Arc::clone(base),
        }
    }
}

impl Indexer for TableIndexer {
    fn index(&self, update: &PartitionUpdate) {
        let schema = self.base.schema();
        for def in &schema.indexes {
            let Some(index_table) = self.base.context().schema.table(def.index_table) else {
                continue;
            };
            for row in update.rows.values() {
                let Some(cell) = row.cells.get(&def.column) else {
                    continue;
                };
                let Some(value) = &cell.value else {
                    // Column tombstones leave the old entry to be filtered
                    // at read time against the base table.
                    continue;
                };
                let entry =
                    derive_entry(&index_table, value.clone(), update.key(), cell.timestamp);
                if let Err(e) = index_table.apply_update(&entry) {
                    tracing::warn!(
                        index = %index_table.schema().qualified_name(),
                        error = %e,
                        "failed to maintain index entry"
                    );
                }
            }
        }
    }
}

fn derive_entry(
    index_table: &Arc<TableStore>,
    value: Vec<u8>,
    base_key: &PartitionKey,
    timestamp: Timestamp,
) -> PartitionUpdate {
    let key = index_table.decorate_key(value);
    let mut entry = PartitionUpdate::new(index_table.id(), key);
    entry.add_row(
        Row::new(Clustering::row(vec![base_key.key().to_vec()]))
            .cell(0, Cell::live(timestamp, Vec::new())),
    );
    entry
}

/// Rebuilds `index` from a full scan of `base`: everything the index holds
/// is discarded, entries are re-derived, and the result is flushed. Used
/// when index compaction hits corruption.
pub fn rebuild(base: &Arc<TableStore>, index: &Arc<TableStore>) -> Result<()> {
    let schema = base.schema();
    let def = schema
        .indexes
        .iter()
        .find(|d| d.index_table == index.id())
        .ok_or_else(|| {
            Error::InvalidRequest(format!(
                "table {} holds no index backed by {}",
                base.id(),
                index.id()
            ))
        })?;

    tracing::info!(
        base = %base.schema().qualified_name(),
        index = %index.schema().qualified_name(),
        "rebuilding index from base table"
    );

    let (_, dropped) = index.tracker().reset(index.new_memtable());
    for table in &dropped {
        table.mark_obsolete();
    }
    drop(dropped);

    for partition in base.read(ReadCommand::full_scan(base.id()))? {
        let partition = partition?;
        for row in &partition.rows {
            let Some(cell) = row.cells.get(&def.column) else {
                continue;
            };
            if let Some(value) = &cell.value {
                let entry = derive_entry(index, value.clone(), &partition.key, cell.timestamp);
                index.apply_update(&entry)?;
            }
        }
    }
    index.flush(FlushReason::IndexBuildCompleted)?.wait()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineContext;
    use crate::schema::{TableId, TableSchema};
    use crate::testdir::TempDir;

    fn setup(dir: &TempDir) -> (Arc<TableStore>, Arc<TableStore>) {
        let ctx = EngineContext::new(EngineConfig::new(dir.path()));
        let base_schema = TableSchema::new("ks", "users", TableId(1))
            .column(0, "name")
            .index("users_by_name", 0, TableId(2));
        let index_schema = TableSchema::new("ks", "users_by_name_idx", TableId(2)).column(0, "x");

        let base = TableStore::open(Arc::clone(&ctx), base_schema, None).unwrap();
        let index = TableStore::open(Arc::clone(&ctx), index_schema, Some(TableId(1))).unwrap();
        ctx.schema.register(Arc::clone(&base));
        ctx.schema.register(Arc::clone(&index));
        (base, index)
    }

    fn put_named(base: &Arc<TableStore>, raw: &[u8], name: &[u8], ts: i64) {
        let key = base.decorate_key(raw.to_vec());
        let mut update = PartitionUpdate::new(base.id(), key);
        update.add_row(
            Row::new(Clustering::row(vec![b"r".to_vec()])).cell(0, Cell::live(ts, name.to_vec())),
        );
        base.apply_update(&update).unwrap();
    }

    fn index_lookup(index: &Arc<TableStore>, name: &[u8]) -> Option<Vec<Vec<u8>>> {
        index
            .get(&ReadCommand::point(
                index.id(),
                index.decorate_key(name.to_vec()),
            ))
            .unwrap()
            .map(|p| {
                p.rows
                    .iter()
                    .map(|r| r.clustering.values()[0].clone())
                    .collect()
            })
    }

    #[test]
    fn test_index_maintained_on_write() {
        let dir = TempDir::new().unwrap();
        let (base, index) = setup(&dir);

        put_named(&base, b"u1", b"alice", 1);
        put_named(&base, b"u2", b"alice", 1);
        put_named(&base, b"u3", b"bob", 1);

        let alices = index_lookup(&index, b"alice").unwrap();
        assert_eq!(alices.len(), 2);
        assert!(alices.contains(&b"u1".to_vec()));

        let bobs = index_lookup(&index, b"bob").unwrap();
        assert_eq!(bobs, vec![b"u3".to_vec()]);
    }

    #[test]
    fn test_base_and_index_switch_together() {
        let dir = TempDir::new().unwrap();
        let (base, index) = setup(&dir);
        put_named(&base, b"u1", b"carol", 1);

        base.flush(FlushReason::UserForced).unwrap().wait().unwrap();
        assert!(base.tracker().view().current.is_clean());
        assert!(
            index.tracker().view().current.is_clean(),
            "index memtable switches with the base table"
        );
        assert_eq!(index_lookup(&index, b"carol").unwrap().len(), 1);
    }

    #[test]
    fn test_rebuild_from_base() {
        let dir = TempDir::new().unwrap();
        let (base, index) = setup(&dir);
        put_named(&base, b"u1", b"dave", 1);
        put_named(&base, b"u2", b"dave", 1);

        // Wreck the index, then rebuild.
        index.tracker().reset(index.new_memtable());
        assert!(index_lookup(&index, b"dave").is_none());

        index.rebuild_index_from_base().unwrap();
        assert_eq!(index_lookup(&index, b"dave").unwrap().len(), 2);
    }
}
