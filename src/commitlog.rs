//! Commit-log position handle and discard contract.
//!
//! The commit-log writer itself lives outside the storage engine; the engine
//! only needs two things from it: a cheap monotonic cursor for "where does
//! the log stand right now", and a way to tell it that everything at or
//! below a position has been made durable in sorted files and may be
//! reclaimed. Both are expressed here.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::schema::TableId;

/// Opaque monotonic cursor into the durable write log: a segment id plus an
/// offset within that segment. Positions compare first by segment, then by
/// offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayPosition {
    pub segment: u64,
    pub offset: u32,
}

impl ReplayPosition {
    /// Sorts before every position a real log can produce.
    pub const NONE: ReplayPosition = ReplayPosition {
        segment: 0,
        offset: 0,
    };

    pub fn new(segment: u64, offset: u32) -> Self {
        Self { segment, offset }
    }
}

impl PartialOrd for ReplayPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReplayPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segment
            .cmp(&other.segment)
            .then(self.offset.cmp(&other.offset))
    }
}

/// The slice of the commit log the engine consumes.
pub trait CommitLog: Send + Sync {
    /// Current append position. Cheap; monotonic.
    fn current_position(&self) -> ReplayPosition;

    /// Requests deletion of segments wholly below `upper` that are not dirty
    /// for any other table. Idempotent; `lower` bounds the range this table
    /// considers its own.
    fn discard_completed_segments(
        &self,
        table: TableId,
        lower: ReplayPosition,
        upper: ReplayPosition,
    );
}

const SEGMENT_SIZE: u32 = 32 * 1024 * 1024;

/// In-process commit log stand-in: hands out monotonic positions and records
/// discard requests. The embedded engine and the test suite run against
/// this; a deployment wires a real log writer behind the same trait.
pub struct MemoryLog {
    cursor: AtomicU64,
    discarded: Mutex<Vec<(TableId, ReplayPosition)>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            cursor: AtomicU64::new(1),
            discarded: Mutex::new(Vec::new()),
        }
    }

    /// Advances the cursor by `bytes`, rolling into a new segment when the
    /// current one fills. Returns the position of the appended record.
    pub fn append(&self, bytes: u32) -> ReplayPosition {
        let raw = self
            .cursor
            .fetch_add(bytes as u64, AtomicOrdering::SeqCst);
        ReplayPosition {
            segment: raw / SEGMENT_SIZE as u64,
            offset: (raw % SEGMENT_SIZE as u64) as u32,
        }
    }

    /// Highest position discarded for `table`, if any. Test observability.
    pub fn discarded_up_to(&self, table: TableId) -> Option<ReplayPosition> {
        self.discarded
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == table)
            .map(|(_, p)| *p)
            .max()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitLog for MemoryLog {
    fn current_position(&self) -> ReplayPosition {
        let raw = self.cursor.load(AtomicOrdering::SeqCst);
        ReplayPosition {
            segment: raw / SEGMENT_SIZE as u64,
            offset: (raw % SEGMENT_SIZE as u64) as u32,
        }
    }

    fn discard_completed_segments(
        &self,
        table: TableId,
        _lower: ReplayPosition,
        upper: ReplayPosition,
    ) {
        self.discarded.lock().unwrap().push((table, upper));
    }
}

/// Log used when a table sets `durable_writes = false`: positions never
/// advance and discards are ignored.
pub struct NoopLog;

impl CommitLog for NoopLog {
    fn current_position(&self) -> ReplayPosition {
        ReplayPosition::NONE
    }

    fn discard_completed_segments(
        &self,
        _table: TableId,
        _lower: ReplayPosition,
        _upper: ReplayPosition,
    ) {
    }
}
