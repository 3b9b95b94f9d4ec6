//! Row cache service.
//!
//! Caches reconciled partition heads keyed by (table, partition key). The
//! eviction policy is a small/main/ghost queue pair with per-entry
//! frequency counters: new entries enter the small queue, entries re-read
//! before eviction graduate to the main queue, and keys evicted from small
//! without a second hit leave a ghost so a quick return promotes them
//! directly.

use std::collections::{HashMap, LinkedList};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::partition::key::PartitionKey;
use crate::partition::update::Row;
use crate::schema::TableId;

const MAX_FREQUENCY: u8 = 3;
const GHOST_FACTOR: usize = 2;

/// A cached slice of a partition: its first rows in clustering order, and
/// whether that slice is the whole partition.
#[derive(Debug, Clone)]
pub struct CachedPartition {
    pub rows: Vec<Row>,
    pub complete: bool,
}

impl CachedPartition {
    /// Whether this entry can answer a read wanting the first
    /// `rows_wanted` rows: either the partition is complete, or the cached
    /// head already holds enough live rows.
    pub fn covers_head(&self, rows_wanted: usize) -> bool {
        self.complete || self.rows.len() >= rows_wanted
    }
}

type Key = (TableId, PartitionKey);

struct Entry {
    key: Key,
    value: Arc<CachedPartition>,
    freq: u8,
}

struct Shard {
    small: LinkedList<Entry>,
    main: LinkedList<Entry>,
    ghost: LinkedList<Key>,
    index: HashMap<Key, Arc<CachedPartition>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            small: LinkedList::new(),
            main: LinkedList::new(),
            ghost: LinkedList::new(),
            index: HashMap::new(),
        }
    }
}

/// Process-wide row cache, shared by every table through the engine
/// context. Capacity is counted in partitions.
pub struct RowCache {
    capacity: usize,
    shard: Mutex<Shard>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl RowCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            shard: Mutex::new(Shard::new()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Disabled cache: lookups always miss, inserts are dropped.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn get(&self, table: TableId, key: &PartitionKey) -> Option<Arc<CachedPartition>> {
        let mut shard = self.shard.lock().unwrap();
        let lookup = (table, key.clone());
        let value = shard.index.get(&lookup).cloned();
        match value {
            Some(value) => {
                let Shard { small, main, .. } = &mut *shard;
                for entry in small.iter_mut().chain(main.iter_mut()) {
                    if entry.key == lookup {
                        entry.freq = (entry.freq + 1).min(MAX_FREQUENCY);
                        break;
                    }
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, table: TableId, key: PartitionKey, value: CachedPartition) {
        if self.capacity == 0 {
            return;
        }
        let mut shard = self.shard.lock().unwrap();
        let key = (table, key);
        let value = Arc::new(value);
        self.evict_to_fit(&mut shard);

        let was_ghost = {
            let mut found = false;
            let mut remaining = LinkedList::new();
            while let Some(ghost) = shard.ghost.pop_front() {
                if ghost == key {
                    found = true;
                } else {
                    remaining.push_back(ghost);
                }
            }
            shard.ghost = remaining;
            found
        };

        shard.index.insert(key.clone(), Arc::clone(&value));
        let entry = Entry {
            key,
            value,
            freq: 0,
        };
        // A recently evicted key returning is hot: skip the small queue.
        if was_ghost {
            shard.main.push_back(entry);
        } else {
            shard.small.push_back(entry);
        }
    }

    /// Drops a single partition, e.g. after it was mutated.
    pub fn invalidate(&self, table: TableId, key: &PartitionKey) {
        let mut shard = self.shard.lock().unwrap();
        let lookup = (table, key.clone());
        if shard.index.remove(&lookup).is_some() {
            retain_list(&mut shard.small, |e| e.key != lookup);
            retain_list(&mut shard.main, |e| e.key != lookup);
        }
    }

    /// Drops every partition of `table`; used by truncate and drop.
    pub fn invalidate_table(&self, table: TableId) {
        let mut shard = self.shard.lock().unwrap();
        shard.index.retain(|(t, _), _| *t != table);
        retain_list(&mut shard.small, |e| e.key.0 != table);
        retain_list(&mut shard.main, |e| e.key.0 != table);
        let mut remaining = LinkedList::new();
        while let Some(ghost) = shard.ghost.pop_front() {
            if ghost.0 != table {
                remaining.push_back(ghost);
            }
        }
        shard.ghost = remaining;
    }

    pub fn len(&self) -> usize {
        self.shard.lock().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn evict_to_fit(&self, shard: &mut Shard) {
        while shard.index.len() >= self.capacity {
            // Prefer evicting from small; entries read since insertion get a
            // second life in main.
            if let Some(entry) = shard.small.pop_front() {
                if entry.freq > 0 {
                    shard.main.push_back(Entry { freq: 0, ..entry });
                } else {
                    shard.index.remove(&entry.key);
                    shard.ghost.push_back(entry.key);
                    while shard.ghost.len() > self.capacity * GHOST_FACTOR {
                        shard.ghost.pop_front();
                    }
                }
            } else if let Some(entry) = shard.main.pop_front() {
                if entry.freq > 0 {
                    shard.main.push_back(Entry {
                        freq: entry.freq - 1,
                        ..entry
                    });
                } else {
                    shard.index.remove(&entry.key);
                }
            } else {
                break;
            }
        }
    }
}

fn retain_list(list: &mut LinkedList<Entry>, keep: impl Fn(&Entry) -> bool) {
    let mut remaining = LinkedList::new();
    while let Some(entry) = list.pop_front() {
        if keep(&entry) {
            remaining.push_back(entry);
        }
    }
    *list = remaining;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::clustering::Clustering;
    use crate::partition::key::{HashPartitioner, Partitioner};
    use crate::partition::update::{Cell, Row};

    fn key(raw: &[u8]) -> PartitionKey {
        PartitionKey::new(&HashPartitioner, raw.to_vec())
    }

    fn partition(rows: usize, complete: bool) -> CachedPartition {
        CachedPartition {
            rows: (0..rows)
                .map(|i| {
                    Row::new(Clustering::row(vec![vec![i as u8]]))
                        .cell(0, Cell::live(1, b"v".to_vec()))
                })
                .collect(),
            complete,
        }
    }

    #[test]
    fn test_get_after_insert() {
        let cache = RowCache::new(16);
        cache.insert(TableId(1), key(b"a"), partition(3, true));

        let hit = cache.get(TableId(1), &key(b"a")).unwrap();
        assert_eq!(hit.rows.len(), 3);
        assert!(cache.get(TableId(2), &key(b"a")).is_none());
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_disabled_cache_drops_inserts() {
        let cache = RowCache::disabled();
        cache.insert(TableId(1), key(b"a"), partition(1, true));
        assert!(cache.get(TableId(1), &key(b"a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_enforced() {
        let cache = RowCache::new(4);
        for i in 0..32u8 {
            cache.insert(TableId(1), key(&[i]), partition(1, true));
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_reread_survives_eviction_pressure() {
        let cache = RowCache::new(4);
        cache.insert(TableId(1), key(b"hot"), partition(1, true));
        // Touch it so its frequency rises.
        cache.get(TableId(1), &key(b"hot"));
        cache.get(TableId(1), &key(b"hot"));

        for i in 0..16u8 {
            cache.insert(TableId(1), key(&[i]), partition(1, true));
        }
        assert!(
            cache.get(TableId(1), &key(b"hot")).is_some(),
            "frequently read entry should survive scan pressure"
        );
    }

    #[test]
    fn test_invalidate_partition_and_table() {
        let cache = RowCache::new(16);
        cache.insert(TableId(1), key(b"a"), partition(1, true));
        cache.insert(TableId(1), key(b"b"), partition(1, true));
        cache.insert(TableId(2), key(b"a"), partition(1, true));

        cache.invalidate(TableId(1), &key(b"a"));
        assert!(cache.get(TableId(1), &key(b"a")).is_none());
        assert!(cache.get(TableId(1), &key(b"b")).is_some());

        cache.invalidate_table(TableId(1));
        assert!(cache.get(TableId(1), &key(b"b")).is_none());
        assert!(cache.get(TableId(2), &key(b"a")).is_some());
    }

    #[test]
    fn test_covers_head() {
        let complete = partition(2, true);
        assert!(complete.covers_head(100));

        let head = partition(5, false);
        assert!(head.covers_head(5));
        assert!(!head.covers_head(6));
    }
}
