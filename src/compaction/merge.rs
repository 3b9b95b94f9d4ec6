//! The compaction merge: k-way combination of sorted files with tombstone
//! garbage collection.
//!
//! Shadowed values can always be dropped, because the tombstone that
//! shadows them is carried into the output and keeps shadowing copies in
//! files outside this compaction. A tombstone itself is dropped only when
//! it is old enough (`gc_grace` past its local deletion time) and no live
//! file outside the compaction could still hold a value it shadows.

use std::iter::Peekable;

use crate::error::{Error, Result};
use crate::partition::key::PartitionKey;
use crate::partition::update::{DeletionTime, PartitionUpdate, Row, Timestamp};
use crate::sstable::{FlatWriter, SsTable, SsTableScanner};

use super::{StopTrigger, StopSignal};

/// Bounds on what the merge may purge.
#[derive(Debug, Clone, Copy)]
pub struct PurgeController {
    /// Wall-clock seconds now.
    pub now_seconds: u32,
    /// Tombstones younger than this many seconds are never purged.
    pub gc_grace_seconds: u64,
    /// Smallest timestamp present in any overlapping live file outside the
    /// compaction. A tombstone at or above it may still shadow data there.
    pub min_other_timestamp: Timestamp,
}

impl PurgeController {
    /// Controller that never purges; used when overlap cannot be ruled out.
    pub fn conservative(now_seconds: u32) -> Self {
        Self {
            now_seconds,
            gc_grace_seconds: u64::MAX,
            min_other_timestamp: Timestamp::MIN,
        }
    }

    fn purgeable(&self, deletion: &DeletionTime) -> bool {
        if deletion.is_live() {
            return false;
        }
        let expiry = deletion.local_deletion_time as u64 + self.gc_grace_seconds;
        expiry <= self.now_seconds as u64
            && deletion.marked_for_delete_at < self.min_other_timestamp
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MergeStats {
    pub partitions_in: u64,
    pub partitions_out: u64,
    pub tombstones_purged: u64,
}

/// Merges `inputs` into `writer`. Polls `stop` between partitions and bails
/// out cooperatively when an interruption was requested.
pub fn merge_sstables(
    inputs: &[SsTable],
    bounds: crate::sstable::KeyBounds,
    writer: &mut FlatWriter,
    controller: &PurgeController,
    stop: &StopSignal,
) -> Result<MergeStats> {
    let mut sources: Vec<Peekable<SsTableScanner>> = inputs
        .iter()
        .map(|t| t.scan(bounds.clone()))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .map(Iterator::peekable)
        .collect();

    let mut stats = MergeStats::default();
    loop {
        match stop.get() {
            StopTrigger::None => {}
            trigger => {
                return Err(Error::InvalidRequest(format!(
                    "compaction interrupted: {trigger:?}"
                )))
            }
        }

        let key = match next_key(&mut sources)? {
            Some(key) => key,
            None => break,
        };

        let mut merged: Option<PartitionUpdate> = None;
        for source in &mut sources {
            let matches = matches!(source.peek(), Some(Ok(u)) if u.key() == &key);
            if matches {
                let update = source.next().expect("peeked")?;
                match merged.as_mut() {
                    Some(base) => {
                        base.merge(&update);
                    }
                    None => merged = Some(update),
                }
            }
        }
        let merged = merged.expect("next_key guarantees a source");
        stats.partitions_in += 1;

        let had_tombstones = merged.has_tombstones();
        if let Some(compacted) = compact_partition(merged, controller) {
            if had_tombstones && !compacted.has_tombstones() {
                stats.tombstones_purged += 1;
            }
            writer.append(&compacted)?;
            stats.partitions_out += 1;
        } else {
            stats.tombstones_purged += u64::from(had_tombstones);
        }
    }
    Ok(stats)
}

fn next_key(sources: &mut [Peekable<SsTableScanner>]) -> Result<Option<PartitionKey>> {
    let mut min: Option<PartitionKey> = None;
    for source in sources.iter_mut() {
        match source.peek() {
            Some(Ok(update)) => {
                let key = update.key();
                min = match min {
                    None => Some(key.clone()),
                    Some(current) if *key < current => Some(key.clone()),
                    Some(current) => Some(current),
                };
            }
            Some(Err(_)) => {
                // Surface the stored error by consuming it.
                return Err(source.next().expect("peeked").unwrap_err());
            }
            None => {}
        }
    }
    Ok(min)
}

/// Rewrites one merged partition for the output file: shadowed values go,
/// purgeable tombstones go, and a partition with nothing left disappears.
pub fn compact_partition(
    update: PartitionUpdate,
    controller: &PurgeController,
) -> Option<PartitionUpdate> {
    let mut out = PartitionUpdate::new(update.table_id(), update.key().clone());
    out.cdc = update.cdc;

    if !update.partition_deletion.is_live() && !controller.purgeable(&update.partition_deletion) {
        out.partition_deletion = update.partition_deletion;
    }
    for rt in &update.range_tombstones {
        if !controller.purgeable(&rt.deletion) {
            out.add_range_tombstone(rt.clone());
        }
    }

    for row in update.rows.values() {
        let enclosing = update.deletion_at(&row.clustering);
        let mut kept = Row::new(row.clustering.clone());
        if !row.deletion.is_live() && !controller.purgeable(&row.deletion) {
            kept.deletion = row.deletion;
        }
        let strongest = if row.deletion.superseded_by(&enclosing) {
            enclosing
        } else {
            row.deletion
        };
        for (column, cell) in &row.cells {
            if cell.is_tombstone() {
                let as_deletion =
                    DeletionTime::new(cell.timestamp, cell.local_deletion_time);
                if !controller.purgeable(&as_deletion) {
                    kept.cells.insert(*column, cell.clone());
                }
            } else if !strongest.deletes(cell.timestamp) {
                kept.cells.insert(*column, cell.clone());
            }
        }
        if !kept.cells.is_empty() || !kept.deletion.is_live() {
            out.add_row(kept);
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::clustering::Clustering;
    use crate::partition::key::HashPartitioner;
    use crate::partition::update::Cell;
    use crate::schema::TableId;

    fn update_with(raw: &[u8], cell: Cell) -> PartitionUpdate {
        let key = PartitionKey::new(&HashPartitioner, raw.to_vec());
        let mut u = PartitionUpdate::new(TableId(1), key);
        u.add_row(Row::new(Clustering::row(vec![b"c".to_vec()])).cell(0, cell));
        u
    }

    #[test]
    fn test_shadowed_value_dropped_tombstone_kept() {
        let mut merged = update_with(b"k", Cell::live(10, b"v".to_vec()));
        merged.delete_partition(DeletionTime::new(20, 1_000));

        // Tombstone too young to purge: it stays, the shadowed value goes.
        let controller = PurgeController {
            now_seconds: 1_100,
            gc_grace_seconds: 864_000,
            min_other_timestamp: Timestamp::MAX,
        };
        let out = compact_partition(merged, &controller).expect("tombstone survives");
        assert!(!out.partition_deletion.is_live());
        assert!(out.rows.is_empty());
    }

    #[test]
    fn test_expired_tombstone_purged() {
        let mut merged = update_with(b"k", Cell::live(10, b"v".to_vec()));
        merged.delete_partition(DeletionTime::new(20, 1_000));

        let controller = PurgeController {
            now_seconds: 1_000_000,
            gc_grace_seconds: 100,
            min_other_timestamp: Timestamp::MAX,
        };
        assert!(
            compact_partition(merged, &controller).is_none(),
            "nothing left once the tombstone and what it shadows are gone"
        );
    }

    #[test]
    fn test_tombstone_kept_while_other_files_hold_older_data() {
        let mut merged = update_with(b"k", Cell::live(10, b"v".to_vec()));
        merged.delete_partition(DeletionTime::new(20, 1_000));

        // A live file outside the compaction holds data at timestamp 5; the
        // tombstone at 20 still shadows it and must survive, however old.
        let controller = PurgeController {
            now_seconds: u32::MAX,
            gc_grace_seconds: 0,
            min_other_timestamp: 5,
        };
        let out = compact_partition(merged, &controller).expect("tombstone survives");
        assert!(!out.partition_deletion.is_live());
    }

    #[test]
    fn test_cell_tombstone_gc() {
        let merged = update_with(b"k", Cell::tombstone(10, 1_000));
        let young = PurgeController {
            now_seconds: 1_050,
            gc_grace_seconds: 100,
            min_other_timestamp: Timestamp::MAX,
        };
        assert!(compact_partition(merged.clone(), &young).is_some());

        let old = PurgeController {
            now_seconds: 2_000,
            gc_grace_seconds: 100,
            min_other_timestamp: Timestamp::MAX,
        };
        assert!(compact_partition(merged, &old).is_none());
    }

    #[test]
    fn test_conservative_controller_never_purges() {
        let mut merged = update_with(b"k", Cell::live(10, b"v".to_vec()));
        merged.delete_partition(DeletionTime::new(20, 0));
        let controller = PurgeController::conservative(u32::MAX);
        assert!(compact_partition(merged, &controller).is_some());
    }
}
