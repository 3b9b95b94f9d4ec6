//! Partition updates and their reconciliation rules.
//!
//! A [`PartitionUpdate`] aggregates everything a mutation can do to one
//! partition of one table: upsert cells into rows, delete clustering
//! ranges, delete the whole partition. Updates grow monotonically under
//! [`PartitionUpdate::merge`]: merging is commutative for cells at distinct
//! (clustering, column) positions, and per-cell reconciliation is
//! last-write-wins by timestamp with a tombstone beating a live value at
//! equal timestamps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::clustering::Clustering;
use super::key::PartitionKey;
use crate::schema::TableId;

/// Microseconds since the epoch, chosen by the coordinator.
pub type Timestamp = i64;

/// Column identifier within a table schema.
pub type ColumnId = u32;

/// A deletion: the timestamp at or below which data is shadowed, plus the
/// wall-clock second the deletion was issued (drives tombstone GC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeletionTime {
    pub marked_for_delete_at: Timestamp,
    pub local_deletion_time: u32,
}

impl DeletionTime {
    pub const LIVE: DeletionTime = DeletionTime {
        marked_for_delete_at: i64::MIN,
        local_deletion_time: u32::MAX,
    };

    pub fn new(marked_for_delete_at: Timestamp, local_deletion_time: u32) -> Self {
        Self {
            marked_for_delete_at,
            local_deletion_time,
        }
    }

    pub fn is_live(&self) -> bool {
        *self == Self::LIVE
    }

    /// Whether data written at `timestamp` is shadowed by this deletion.
    pub fn deletes(&self, timestamp: Timestamp) -> bool {
        timestamp <= self.marked_for_delete_at
    }

    /// The more recent of two deletions.
    pub fn superseded_by(&self, other: &DeletionTime) -> bool {
        (other.marked_for_delete_at, other.local_deletion_time)
            > (self.marked_for_delete_at, self.local_deletion_time)
    }
}

/// A single column value or column tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub timestamp: Timestamp,
    /// `None` marks a deleted column.
    pub value: Option<Vec<u8>>,
    /// Wall-clock second of deletion; meaningful only for tombstones.
    pub local_deletion_time: u32,
}

impl Cell {
    pub fn live(timestamp: Timestamp, value: Vec<u8>) -> Self {
        Self {
            timestamp,
            value: Some(value),
            local_deletion_time: u32::MAX,
        }
    }

    pub fn tombstone(timestamp: Timestamp, local_deletion_time: u32) -> Self {
        Self {
            timestamp,
            value: None,
            local_deletion_time,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Last-write-wins reconciliation. Equal timestamps: a tombstone beats a
    /// value; two values tie-break on content so replicas converge.
    pub fn reconcile<'a>(a: &'a Cell, b: &'a Cell) -> &'a Cell {
        if a.timestamp != b.timestamp {
            return if a.timestamp > b.timestamp { a } else { b };
        }
        match (a.is_tombstone(), b.is_tombstone()) {
            (true, false) => a,
            (false, true) => b,
            (true, true) => {
                if a.local_deletion_time >= b.local_deletion_time {
                    a
                } else {
                    b
                }
            }
            (false, false) => {
                if a.value >= b.value {
                    a
                } else {
                    b
                }
            }
        }
    }

    pub fn serialized_size(&self) -> usize {
        8 + 4 + 4 + self.value.as_ref().map_or(0, |v| v.len())
    }
}

/// A row: a clustering position, an optional row deletion, and cells by
/// column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub clustering: Clustering,
    pub deletion: DeletionTime,
    pub cells: BTreeMap<ColumnId, Cell>,
}

impl Row {
    pub fn new(clustering: Clustering) -> Self {
        Self {
            clustering,
            deletion: DeletionTime::LIVE,
            cells: BTreeMap::new(),
        }
    }

    pub fn cell(mut self, column: ColumnId, cell: Cell) -> Self {
        self.cells.insert(column, cell);
        self
    }

    pub fn deleted_at(mut self, deletion: DeletionTime) -> Self {
        self.deletion = deletion;
        self
    }

    /// Merges `other` into this row, returning the smallest timestamp
    /// distance among reconciled overlapping cells, if any overlapped.
    pub fn merge(&mut self, other: &Row) -> Option<i64> {
        if self.deletion.superseded_by(&other.deletion) {
            self.deletion = other.deletion;
        }
        let mut min_delta: Option<i64> = None;
        for (column, incoming) in &other.cells {
            match self.cells.get_mut(column) {
                Some(existing) => {
                    let delta = (incoming.timestamp - existing.timestamp).abs();
                    min_delta = Some(min_delta.map_or(delta, |d| d.min(delta)));
                    let winner = Cell::reconcile(existing, incoming).clone();
                    *existing = winner;
                }
                None => {
                    self.cells.insert(*column, incoming.clone());
                }
            }
        }
        min_delta
    }

    /// True if anything in the row outlives `deletion` (the strongest
    /// enclosing partition or range deletion).
    pub fn is_live_after(&self, deletion: &DeletionTime) -> bool {
        let shadow = if self.deletion.superseded_by(deletion) {
            deletion
        } else {
            &self.deletion
        };
        self.cells
            .values()
            .any(|c| !c.is_tombstone() && !shadow.deletes(c.timestamp))
    }

    /// The row with shadowed and deleted cells dropped. `None` when nothing
    /// survives.
    pub fn purge(&self, enclosing: &DeletionTime) -> Option<Row> {
        let shadow = if self.deletion.superseded_by(enclosing) {
            *enclosing
        } else {
            self.deletion
        };
        let cells: BTreeMap<ColumnId, Cell> = self
            .cells
            .iter()
            .filter(|(_, c)| !c.is_tombstone() && !shadow.deletes(c.timestamp))
            .map(|(id, c)| (*id, c.clone()))
            .collect();
        if cells.is_empty() {
            return None;
        }
        Some(Row {
            clustering: self.clustering.clone(),
            deletion: DeletionTime::LIVE,
            cells,
        })
    }

    pub fn serialized_size(&self) -> usize {
        self.clustering.serialized_size()
            + 12
            + self.cells.values().map(|c| 4 + c.serialized_size()).sum::<usize>()
    }
}

/// Deletion of a clustering range, bracketed by bound/boundary clusterings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeTombstone {
    pub start: Clustering,
    pub end: Clustering,
    pub deletion: DeletionTime,
}

impl RangeTombstone {
    pub fn new(start: Clustering, end: Clustering, deletion: DeletionTime) -> Self {
        Self {
            start,
            end,
            deletion,
        }
    }

    pub fn covers(&self, clustering: &Clustering) -> bool {
        self.start <= *clustering && *clustering <= self.end
    }

    pub fn serialized_size(&self) -> usize {
        self.start.serialized_size() + self.end.serialized_size() + 12
    }
}

/// What a `put` into the memtable reports back: how much the memtable grew,
/// and how far apart in time the overwrite was (for the write-interval
/// histogram). `timestamp_delta` is `None` when nothing overlapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutDelta {
    pub bytes: usize,
    pub timestamp_delta: Option<i64>,
}

/// All pending changes to one partition of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionUpdate {
    key: PartitionKey,
    table_id: TableId,
    pub partition_deletion: DeletionTime,
    pub rows: BTreeMap<Clustering, Row>,
    pub range_tombstones: Vec<RangeTombstone>,
    /// Tagged when the owning table has change-data-capture enabled.
    pub cdc: bool,
}

impl PartitionUpdate {
    pub fn new(table_id: TableId, key: PartitionKey) -> Self {
        Self {
            key,
            table_id,
            partition_deletion: DeletionTime::LIVE,
            rows: BTreeMap::new(),
            range_tombstones: Vec::new(),
            cdc: false,
        }
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn add_row(&mut self, row: Row) {
        match self.rows.get_mut(&row.clustering) {
            Some(existing) => {
                existing.merge(&row);
            }
            None => {
                self.rows.insert(row.clustering.clone(), row);
            }
        }
    }

    pub fn add_range_tombstone(&mut self, tombstone: RangeTombstone) {
        self.range_tombstones.push(tombstone);
    }

    pub fn delete_partition(&mut self, deletion: DeletionTime) {
        if self.partition_deletion.superseded_by(&deletion) {
            self.partition_deletion = deletion;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
            && self.range_tombstones.is_empty()
            && self.partition_deletion.is_live()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Merges `other` into this update in place. Returns the byte growth and
    /// the smallest overlapping-cell timestamp distance.
    pub fn merge(&mut self, other: &PartitionUpdate) -> PutDelta {
        debug_assert_eq!(self.key, other.key);
        debug_assert_eq!(self.table_id, other.table_id);

        let before = self.serialized_size();
        if self.partition_deletion.superseded_by(&other.partition_deletion) {
            self.partition_deletion = other.partition_deletion;
        }
        let mut min_delta: Option<i64> = None;
        for row in other.rows.values() {
            match self.rows.get_mut(&row.clustering) {
                Some(existing) => {
                    if let Some(delta) = existing.merge(row) {
                        min_delta = Some(min_delta.map_or(delta, |d| d.min(delta)));
                    }
                }
                None => {
                    self.rows.insert(row.clustering.clone(), row.clone());
                }
            }
        }
        self.range_tombstones
            .extend(other.range_tombstones.iter().cloned());
        self.cdc |= other.cdc;

        let after = self.serialized_size();
        PutDelta {
            bytes: after.saturating_sub(before),
            timestamp_delta: min_delta,
        }
    }

    /// The strongest deletion shadowing `clustering`: the partition deletion
    /// or any covering range tombstone.
    pub fn deletion_at(&self, clustering: &Clustering) -> DeletionTime {
        let mut strongest = self.partition_deletion;
        for rt in &self.range_tombstones {
            if rt.covers(clustering) && strongest.superseded_by(&rt.deletion) {
                strongest = rt.deletion;
            }
        }
        strongest
    }

    /// Live rows only, with shadowed cells dropped. The read path applies
    /// this after reconciling across all sources.
    pub fn purged_rows(&self) -> Vec<Row> {
        self.rows
            .values()
            .filter_map(|row| row.purge(&self.deletion_at(&row.clustering)))
            .collect()
    }

    pub fn serialized_size(&self) -> usize {
        self.key.serialized_size()
            + 16
            + self.rows.values().map(Row::serialized_size).sum::<usize>()
            + self
                .range_tombstones
                .iter()
                .map(RangeTombstone::serialized_size)
                .sum::<usize>()
    }

    /// Extremes over every timestamp in the update, deletions included.
    pub fn timestamp_bounds(&self) -> (Timestamp, Timestamp) {
        let mut min = Timestamp::MAX;
        let mut max = Timestamp::MIN;
        let mut observe = |ts: Timestamp| {
            min = min.min(ts);
            max = max.max(ts);
        };
        if !self.partition_deletion.is_live() {
            observe(self.partition_deletion.marked_for_delete_at);
        }
        for rt in &self.range_tombstones {
            observe(rt.deletion.marked_for_delete_at);
        }
        for row in self.rows.values() {
            if !row.deletion.is_live() {
                observe(row.deletion.marked_for_delete_at);
            }
            for cell in row.cells.values() {
                observe(cell.timestamp);
            }
        }
        if min == Timestamp::MAX {
            (0, 0)
        } else {
            (min, max)
        }
    }

    /// Smallest local deletion time of any tombstone in the update, or
    /// `u32::MAX` when none exist. Drives the sorted-file statistics used
    /// by tombstone GC.
    pub fn min_local_deletion_time(&self) -> u32 {
        let mut min = u32::MAX;
        if !self.partition_deletion.is_live() {
            min = min.min(self.partition_deletion.local_deletion_time);
        }
        for rt in &self.range_tombstones {
            min = min.min(rt.deletion.local_deletion_time);
        }
        for row in self.rows.values() {
            if !row.deletion.is_live() {
                min = min.min(row.deletion.local_deletion_time);
            }
            for cell in row.cells.values() {
                if cell.is_tombstone() {
                    min = min.min(cell.local_deletion_time);
                }
            }
        }
        min
    }

    /// Whether any tombstone remains in the update.
    pub fn has_tombstones(&self) -> bool {
        self.min_local_deletion_time() != u32::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::key::{HashPartitioner, Partitioner};

    fn key(raw: &[u8]) -> PartitionKey {
        PartitionKey::new(&HashPartitioner, raw.to_vec())
    }

    fn update_with_cell(ts: Timestamp, value: &[u8]) -> PartitionUpdate {
        let mut update = PartitionUpdate::new(TableId(1), key(b"k1"));
        update.add_row(Row::new(Clustering::row(vec![b"c1".to_vec()])).cell(0, Cell::live(ts, value.to_vec())));
        update
    }

    #[test]
    fn test_last_write_wins() {
        let mut base = update_with_cell(10, b"old");
        let delta = base.merge(&update_with_cell(20, b"new"));

        assert_eq!(delta.timestamp_delta, Some(10));
        let row = base.rows.values().next().unwrap();
        assert_eq!(row.cells[&0].value.as_deref(), Some(b"new".as_ref()));
    }

    #[test]
    fn test_older_write_loses() {
        let mut base = update_with_cell(20, b"new");
        base.merge(&update_with_cell(10, b"old"));
        let row = base.rows.values().next().unwrap();
        assert_eq!(row.cells[&0].value.as_deref(), Some(b"new".as_ref()));
    }

    #[test]
    fn test_tombstone_beats_value_at_equal_timestamp() {
        let mut base = update_with_cell(10, b"v");
        let mut tomb = PartitionUpdate::new(TableId(1), key(b"k1"));
        tomb.add_row(
            Row::new(Clustering::row(vec![b"c1".to_vec()])).cell(0, Cell::tombstone(10, 1000)),
        );
        base.merge(&tomb);

        let row = base.rows.values().next().unwrap();
        assert!(row.cells[&0].is_tombstone());
        assert!(base.purged_rows().is_empty());
    }

    #[test]
    fn test_merge_commutes_for_distinct_cells() {
        let mut a = PartitionUpdate::new(TableId(1), key(b"k1"));
        a.add_row(Row::new(Clustering::row(vec![b"c1".to_vec()])).cell(0, Cell::live(1, b"a".to_vec())));
        let mut b = PartitionUpdate::new(TableId(1), key(b"k1"));
        b.add_row(Row::new(Clustering::row(vec![b"c2".to_vec()])).cell(1, Cell::live(2, b"b".to_vec())));

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab.rows, ba.rows);
    }

    #[test]
    fn test_no_prior_reports_no_delta() {
        let mut base = PartitionUpdate::new(TableId(1), key(b"k1"));
        let delta = base.merge(&update_with_cell(5, b"v"));
        assert_eq!(delta.timestamp_delta, None);
        assert!(delta.bytes > 0);
    }

    #[test]
    fn test_partition_deletion_shadows_rows() {
        let mut base = update_with_cell(10, b"v");
        base.delete_partition(DeletionTime::new(15, 2000));
        assert!(base.purged_rows().is_empty());

        // A later write resurfaces.
        base.merge(&update_with_cell(20, b"w"));
        assert_eq!(base.purged_rows().len(), 1);
    }

    #[test]
    fn test_range_tombstone_covers() {
        let mut base = PartitionUpdate::new(TableId(1), key(b"k1"));
        for c in [b"a", b"m", b"z"] {
            base.add_row(Row::new(Clustering::row(vec![c.to_vec()])).cell(0, Cell::live(10, b"v".to_vec())));
        }
        use crate::partition::clustering::ClusteringKind;
        base.add_range_tombstone(RangeTombstone::new(
            Clustering::bound(ClusteringKind::InclStartBound, vec![b"a".to_vec()]),
            Clustering::bound(ClusteringKind::InclEndBound, vec![b"m".to_vec()]),
            DeletionTime::new(15, 2000),
        ));

        let live = base.purged_rows();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].clustering, Clustering::row(vec![b"z".to_vec()]));
    }

    #[test]
    fn test_timestamp_bounds_and_min_ldt() {
        let mut update = update_with_cell(10, b"v");
        update.merge(&update_with_cell(30, b"w"));
        let (min, max) = update.timestamp_bounds();
        assert_eq!((min, max), (30, 30));
        assert_eq!(update.min_local_deletion_time(), u32::MAX);

        let mut tomb = PartitionUpdate::new(TableId(1), key(b"k1"));
        tomb.add_row(
            Row::new(Clustering::row(vec![b"c2".to_vec()])).cell(0, Cell::tombstone(5, 777)),
        );
        update.merge(&tomb);
        assert_eq!(update.timestamp_bounds(), (5, 30));
        assert_eq!(update.min_local_deletion_time(), 777);
        assert!(update.has_tombstones());
    }
}
