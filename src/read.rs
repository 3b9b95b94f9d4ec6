//! The read path: merged iteration over memtables and sorted files.
//!
//! A read builds one source per storage location the tracker view names
//! (current memtable, flushing memtables, intersecting sorted files) and
//! lazily merges them in partition-key order. Reconciliation happens per
//! partition: all pending updates for a key merge by last-write-wins, then
//! tombstones shadow what they cover, then the clustering and column
//! filters and the data limits apply. A partition fully answered by the row
//! cache skips the merge entirely.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;

use crc::{Crc, CRC_64_ECMA_182};

use crate::cache::{CachedPartition, RowCache};
use crate::error::{Error, Result};
use crate::memtable::{Memtable, MemtablePartitionIterator};
use crate::partition::clustering::Clustering;
use crate::partition::key::PartitionKey;
use crate::partition::update::{ColumnId, PartitionUpdate, Row};
use crate::schema::TableId;
use crate::sstable::{KeyBounds, SsTable, SsTableScanner};

/// What part of the table a read addresses.
#[derive(Debug, Clone)]
pub enum PartitionSelection {
    Key(PartitionKey),
    Range(KeyBounds),
}

impl PartitionSelection {
    pub fn bounds(&self) -> KeyBounds {
        match self {
            PartitionSelection::Key(key) => {
                (Bound::Included(key.clone()), Bound::Included(key.clone()))
            }
            PartitionSelection::Range(bounds) => bounds.clone(),
        }
    }
}

/// Restriction on clusterings within each partition.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusteringFilter {
    All,
    Slice { start: Clustering, end: Clustering },
    Names(BTreeSet<Clustering>),
}

impl ClusteringFilter {
    pub fn selects(&self, clustering: &Clustering) -> bool {
        match self {
            ClusteringFilter::All => true,
            ClusteringFilter::Slice { start, end } => start <= clustering && clustering <= end,
            ClusteringFilter::Names(names) => names.contains(clustering),
        }
    }

    /// A head filter selects a prefix of the partition, which is what the
    /// cached head of a partition can answer.
    pub fn is_head(&self) -> bool {
        match self {
            ClusteringFilter::All => true,
            ClusteringFilter::Slice { start, .. } => *start <= Clustering::bottom(),
            ClusteringFilter::Names(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnFilter {
    All,
    Subset(BTreeSet<ColumnId>),
}

impl ColumnFilter {
    pub fn selects(&self, column: ColumnId) -> bool {
        match self {
            ColumnFilter::All => true,
            ColumnFilter::Subset(set) => set.contains(&column),
        }
    }
}

/// Limits applied after reconciliation.
#[derive(Debug, Clone, Copy)]
pub struct DataLimits {
    pub partition_limit: usize,
    /// Rows returned per partition.
    pub row_limit: usize,
}

impl Default for DataLimits {
    fn default() -> Self {
        Self {
            partition_limit: usize::MAX,
            row_limit: usize::MAX,
        }
    }
}

/// A fully described read.
#[derive(Debug, Clone)]
pub struct ReadCommand {
    pub table: TableId,
    pub selection: PartitionSelection,
    pub clustering_filter: ClusteringFilter,
    pub column_filter: ColumnFilter,
    pub limits: DataLimits,
    /// Wall-clock seconds; drives liveness decisions downstream.
    pub now: u32,
    /// Digest reads return a hash instead of rows.
    pub digest: bool,
    pub deadline: Option<Instant>,
}

impl ReadCommand {
    pub fn full_scan(table: TableId) -> Self {
        Self {
            table,
            selection: PartitionSelection::Range((Bound::Unbounded, Bound::Unbounded)),
            clustering_filter: ClusteringFilter::All,
            column_filter: ColumnFilter::All,
            limits: DataLimits::default(),
            now: (crate::sstable::format::wall_clock_millis() / 1000) as u32,
            digest: false,
            deadline: None,
        }
    }

    pub fn point(table: TableId, key: PartitionKey) -> Self {
        Self {
            selection: PartitionSelection::Key(key),
            ..Self::full_scan(table)
        }
    }

    pub fn range(table: TableId, bounds: KeyBounds) -> Self {
        Self {
            selection: PartitionSelection::Range(bounds),
            ..Self::full_scan(table)
        }
    }

    pub fn clustering(mut self, filter: ClusteringFilter) -> Self {
        self.clustering_filter = filter;
        self
    }

    pub fn columns(mut self, filter: ColumnFilter) -> Self {
        self.column_filter = filter;
        self
    }

    pub fn limits(mut self, limits: DataLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// One reconciled partition of a read result.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPartition {
    pub key: PartitionKey,
    pub rows: Vec<Row>,
}

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

impl ReadPartition {
    /// Content digest for digest reads; equal partitions hash equal.
    pub fn digest(&self) -> u64 {
        let bytes = bincode::serialize(&(self.key.clone(), &self.rows)).unwrap_or_default();
        CRC64.checksum(&bytes)
    }
}

enum SourceIter {
    Memtable(MemtablePartitionIterator),
    SsTable(SsTableScanner),
}

/// A peekable stream of partition updates from one storage location.
pub struct Source {
    iter: SourceIter,
    peeked: Option<PartitionUpdate>,
}

impl Source {
    pub fn from_memtable(memtable: &Arc<Memtable>, bounds: KeyBounds) -> Self {
        Self {
            iter: SourceIter::Memtable(memtable.partition_iterator(bounds)),
            peeked: None,
        }
    }

    pub fn from_sstable(table: &SsTable, bounds: KeyBounds) -> Result<Self> {
        Ok(Self {
            iter: SourceIter::SsTable(table.scan(bounds)?),
            peeked: None,
        })
    }

    fn fill(&mut self) -> Result<()> {
        if self.peeked.is_some() {
            return Ok(());
        }
        self.peeked = match &mut self.iter {
            SourceIter::Memtable(iter) => iter.next(),
            SourceIter::SsTable(iter) => iter.next().transpose()?,
        };
        Ok(())
    }

    fn peek_key(&mut self) -> Result<Option<&PartitionKey>> {
        self.fill()?;
        Ok(self.peeked.as_ref().map(|u| u.key()))
    }

    fn take_if(&mut self, key: &PartitionKey) -> Option<PartitionUpdate> {
        if self.peeked.as_ref().map(|u| u.key()) == Some(key) {
            self.peeked.take()
        } else {
            None
        }
    }
}

/// Cache plumbing for a read: the shared cache plus this table's bound on
/// rows cached per partition.
pub struct CacheContext {
    pub cache: Arc<RowCache>,
    pub table: TableId,
    pub rows_to_cache: u32,
}

/// Lazily merged partition iterator over a fixed set of sources. Holds the
/// tracker view and a read-order group alive for its whole lifetime so
/// memtable reclaim and file deletion wait for it.
pub struct PartitionIterator {
    sources: Vec<Source>,
    cmd: ReadCommand,
    cache: Option<CacheContext>,
    partitions_returned: usize,
    failed: bool,
    _pins: Vec<Box<dyn std::any::Any + Send>>,
}

impl PartitionIterator {
    pub fn new(sources: Vec<Source>, cmd: ReadCommand, cache: Option<CacheContext>) -> Self {
        Self {
            sources,
            cmd,
            cache,
            partitions_returned: 0,
            failed: false,
            _pins: Vec::new(),
        }
    }

    /// Attaches objects that must outlive the iteration (tracker view,
    /// read-order group).
    pub fn pinned(mut self, pin: Box<dyn std::any::Any + Send>) -> Self {
        self._pins.push(pin);
        self
    }

    fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.cmd.deadline {
            if Instant::now() > deadline {
                return Err(Error::Timeout("read deadline exceeded".to_string()));
            }
        }
        Ok(())
    }

    /// Key of the next partition across all sources, or `None` at the end.
    /// A source error poisons the whole iterator; every other source is
    /// dropped with it when the iterator goes away.
    fn next_key(&mut self) -> Result<Option<PartitionKey>> {
        let mut min: Option<PartitionKey> = None;
        for source in &mut self.sources {
            if let Some(key) = source.peek_key()? {
                min = match min {
                    None => Some(key.clone()),
                    Some(current) if *key < current => Some(key.clone()),
                    Some(current) => Some(current),
                };
            }
        }
        Ok(min)
    }

    fn serve_from_cache(&mut self, key: &PartitionKey) -> Option<Vec<Row>> {
        let ctx = self.cache.as_ref()?;
        if ctx.rows_to_cache == 0 || !self.cmd.clustering_filter.is_head() {
            return None;
        }
        let cached = ctx.cache.get(ctx.table, key)?;
        let wanted = self.cmd.limits.row_limit;
        // An unlimited read is only covered by a complete partition; a
        // limited one by a head holding at least that many rows.
        let covered = if wanted == usize::MAX {
            cached.complete
        } else {
            cached.covers_head(wanted)
        };
        if !covered {
            return None;
        }
        // The cache can answer: drain this key from every source without
        // merging and serve the cached head.
        for source in &mut self.sources {
            source.take_if(key);
        }
        Some(
            cached
                .rows
                .iter()
                .filter(|row| self.cmd.clustering_filter.selects(&row.clustering))
                .take(wanted)
                .map(|row| project_columns(row, &self.cmd.column_filter))
                .collect(),
        )
    }

    fn populate_cache(&self, key: &PartitionKey, live_rows: &[Row]) {
        let Some(ctx) = self.cache.as_ref() else { return };
        if ctx.rows_to_cache == 0 {
            return;
        }
        // Only unfiltered reads see enough to cache truthfully.
        if self.cmd.clustering_filter != ClusteringFilter::All
            || self.cmd.column_filter != ColumnFilter::All
        {
            return;
        }
        let bound = ctx.rows_to_cache as usize;
        let complete = live_rows.len() <= bound;
        let rows: Vec<Row> = live_rows.iter().take(bound).cloned().collect();
        ctx.cache
            .insert(ctx.table, key.clone(), CachedPartition { rows, complete });
    }
}

impl Iterator for PartitionIterator {
    type Item = Result<ReadPartition>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.partitions_returned >= self.cmd.limits.partition_limit {
            return None;
        }
        loop {
            if let Err(e) = self.check_deadline() {
                self.failed = true;
                return Some(Err(e));
            }
            let key = match self.next_key() {
                Ok(Some(key)) => key,
                Ok(None) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };

            if let Some(rows) = self.serve_from_cache(&key) {
                if rows.is_empty() {
                    continue;
                }
                self.partitions_returned += 1;
                return Some(Ok(ReadPartition { key, rows }));
            }

            // Merge every source's pending state for this key.
            let mut merged: Option<PartitionUpdate> = None;
            for source in &mut self.sources {
                if let Some(update) = source.take_if(&key) {
                    match merged.as_mut() {
                        Some(base) => {
                            base.merge(&update);
                        }
                        None => merged = Some(update),
                    }
                }
            }
            let merged = merged.expect("next_key guarantees at least one source");

            let live_rows = merged.purged_rows();
            self.populate_cache(&key, &live_rows);

            let rows: Vec<Row> = live_rows
                .into_iter()
                .filter(|row| self.cmd.clustering_filter.selects(&row.clustering))
                .take(self.cmd.limits.row_limit)
                .map(|row| project_columns(&row, &self.cmd.column_filter))
                .collect();
            if rows.is_empty() {
                continue;
            }
            self.partitions_returned += 1;
            return Some(Ok(ReadPartition { key, rows }));
        }
    }
}

fn project_columns(row: &Row, filter: &ColumnFilter) -> Row {
    match filter {
        ColumnFilter::All => row.clone(),
        ColumnFilter::Subset(_) => {
            let mut projected = Row::new(row.clustering.clone());
            projected.deletion = row.deletion;
            for (column, cell) in &row.cells {
                if filter.selects(*column) {
                    projected.cells.insert(*column, cell.clone());
                }
            }
            projected
        }
    }
}

/// Point-read reconciliation over already-fetched per-source states.
pub fn reconcile_point(
    states: Vec<PartitionUpdate>,
    cmd: &ReadCommand,
) -> Option<ReadPartition> {
    let mut merged: Option<PartitionUpdate> = None;
    for state in states {
        match merged.as_mut() {
            Some(base) => {
                base.merge(&state);
            }
            None => merged = Some(state),
        }
    }
    let merged = merged?;
    let key = merged.key().clone();
    let rows: Vec<Row> = merged
        .purged_rows()
        .into_iter()
        .filter(|row| cmd.clustering_filter.selects(&row.clustering))
        .take(cmd.limits.row_limit)
        .map(|row| project_columns(&row, &cmd.column_filter))
        .collect();
    if rows.is_empty() {
        None
    } else {
        Some(ReadPartition { key, rows })
    }
}
