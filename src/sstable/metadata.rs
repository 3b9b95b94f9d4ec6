use serde::{Deserialize, Serialize};

use crate::partition::key::PartitionKey;
use crate::partition::update::Timestamp;

/// Repaired-at value for files that incremental repair has not touched.
pub const UNREPAIRED: i64 = 0;

/// Statistics sealed into a sorted file at write time. Range reads prune on
/// the key bounds, tombstone GC consults the timestamp extremes and the
/// minimum local deletion time, and truncation compares against
/// `max_data_age`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsMetadata {
    pub first_key: PartitionKey,
    pub last_key: PartitionKey,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub min_local_deletion_time: u32,
    /// Wall-clock millis at seal time; every contained write is older.
    pub max_data_age: i64,
    /// Millis timestamp of the repair that produced this file; `UNREPAIRED`
    /// for files no repair has touched.
    pub repaired_at: i64,
    /// Session id while an incremental repair holds this file.
    pub pending_repair: Option<u64>,
    pub entry_count: u64,
    /// Total bytes of partition payload in the data component.
    pub data_size: u64,
}

impl StatsMetadata {
    pub fn is_repaired(&self) -> bool {
        self.repaired_at != UNREPAIRED
    }

    /// Whether `[first_key, last_key]` intersects the given key interval.
    pub fn intersects(
        &self,
        lower: &std::ops::Bound<PartitionKey>,
        upper: &std::ops::Bound<PartitionKey>,
    ) -> bool {
        use std::ops::Bound;
        let below = match upper {
            Bound::Included(k) => self.first_key <= *k,
            Bound::Excluded(k) => self.first_key < *k,
            Bound::Unbounded => true,
        };
        let above = match lower {
            Bound::Included(k) => self.last_key >= *k,
            Bound::Excluded(k) => self.last_key > *k,
            Bound::Unbounded => true,
        };
        below && above
    }
}
