//! The tracker: the authoritative registry of a table's storage sources.
//!
//! All mutable state lives in one immutable [`View`] behind an atomic
//! reference. Readers grab the reference once and iterate against it
//! unaffected by later transitions; every mutation is a compare-and-swap
//! loop that builds a complete replacement view. Bookkeeping (sizes,
//! counts) is recomputed from the new view, never adjusted in place.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::memtable::Memtable;
use crate::sstable::{KeyBounds, SsTable};

/// Events published to subscribers on every tracker transition. Observers
/// hold plain callbacks, not references back into the tracker.
#[derive(Debug, Clone)]
pub enum Notification {
    /// New sorted files became live (flush, compaction output, streaming).
    SsTablesAdded { generations: Vec<u64> },
    /// Live list changed shape: some files in, some out.
    ListChanged {
        added: Vec<u64>,
        removed: Vec<u64>,
    },
    MemtableSwitched,
    MemtableRenewed,
    MemtableDiscarded,
    TruncationRecorded { truncated_at: i64 },
}

pub type Subscriber = Box<dyn Fn(&Notification) + Send + Sync>;

/// Immutable snapshot of (current memtable, flushing memtables, live sorted
/// files, compacting generations). Readers hold it by value.
pub struct View {
    pub current: Arc<Memtable>,
    /// Switched-out memtables awaiting flush, oldest first.
    pub flushing: Vec<Arc<Memtable>>,
    pub live: Vec<SsTable>,
    /// Generations reserved by a running compaction.
    pub compacting: HashSet<u64>,
}

impl View {
    fn cloned(&self) -> View {
        View {
            current: Arc::clone(&self.current),
            flushing: self.flushing.clone(),
            live: self.live.clone(),
            compacting: self.compacting.clone(),
        }
    }

    /// Every memtable a read must consult: flushing ones first (older data),
    /// then the current one.
    pub fn memtables(&self) -> impl Iterator<Item = &Arc<Memtable>> {
        self.flushing.iter().chain(std::iter::once(&self.current))
    }

    /// Live files whose key interval intersects `range`.
    pub fn sstables_in(&self, range: &KeyBounds) -> Vec<SsTable> {
        self.live
            .iter()
            .filter(|t| t.intersects(range))
            .cloned()
            .collect()
    }

    pub fn live_generations(&self) -> Vec<u64> {
        self.live.iter().map(SsTable::generation).collect()
    }

    /// Total memtable payload, recomputed from the view.
    pub fn memtable_live_bytes(&self) -> usize {
        self.memtables().map(|m| m.live_bytes()).sum()
    }

    pub fn live_data_size(&self) -> u64 {
        self.live.iter().map(|t| t.stats().data_size).sum()
    }
}

pub struct Tracker {
    view: RwLock<Arc<View>>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl Tracker {
    pub fn new(initial: Arc<Memtable>) -> Self {
        Self {
            view: RwLock::new(Arc::new(View {
                current: initial,
                flushing: Vec::new(),
                live: Vec::new(),
                compacting: HashSet::new(),
            })),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// The current view. Readers call this once per operation.
    pub fn view(&self) -> Arc<View> {
        Arc::clone(&self.view.read().unwrap())
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    fn notify(&self, notification: Notification) {
        for subscriber in self.subscribers.read().unwrap().iter() {
            subscriber(&notification);
        }
    }

    /// Compare-and-swap loop over the view reference. `f` must be pure: it
    /// may run more than once when transitions race.
    fn mutate<R>(&self, f: impl Fn(&mut View) -> R) -> R {
        loop {
            let snapshot = self.view();
            let mut next = snapshot.cloned();
            let result = f(&mut next);
            let mut guard = self.view.write().unwrap();
            if Arc::ptr_eq(&guard, &snapshot) {
                *guard = Arc::new(next);
                return result;
            }
            // Lost the race; rebuild against the newer view.
        }
    }

    /// Replaces the current memtable. Unless truncating, the old one moves
    /// to the flushing list. Returns the old memtable.
    pub fn switch_memtable(&self, truncating: bool, new: Arc<Memtable>) -> Arc<Memtable> {
        let old = self.mutate(|view| {
            let old = std::mem::replace(&mut view.current, Arc::clone(&new));
            if !truncating {
                view.flushing.push(Arc::clone(&old));
            }
            old
        });
        self.notify(Notification::MemtableSwitched);
        old
    }

    /// Moves an active memtable to the flushing list without renewing the
    /// current one; used when the switch itself was deferred.
    pub fn mark_flushing(&self, memtable: &Arc<Memtable>) {
        self.mutate(|view| {
            if !view.flushing.iter().any(|m| Arc::ptr_eq(m, memtable)) {
                view.flushing.push(Arc::clone(memtable));
            }
        });
    }

    /// Completes a flush: drops `flushed` from the flushing list and makes
    /// `produced` live in the same transition, so no view ever shows both
    /// or neither.
    pub fn replace_flushed(&self, flushed: &Arc<Memtable>, produced: Vec<SsTable>) {
        let generations: Vec<u64> = produced.iter().map(SsTable::generation).collect();
        self.mutate(|view| {
            view.flushing.retain(|m| !Arc::ptr_eq(m, flushed));
            view.live.extend(produced.iter().cloned());
        });
        if !generations.is_empty() {
            self.notify(Notification::SsTablesAdded { generations });
        }
    }

    /// Makes files live outside a flush (startup, streaming).
    pub fn add_sstables(&self, tables: Vec<SsTable>) {
        let generations: Vec<u64> = tables.iter().map(SsTable::generation).collect();
        self.mutate(|view| view.live.extend(tables.iter().cloned()));
        self.notify(Notification::SsTablesAdded { generations });
    }

    /// Atomically swaps `removed` generations for `added` files. The
    /// removed handles are returned so the caller can mark them obsolete;
    /// their compacting reservation is released in the same transition.
    pub fn replace_sstables(&self, removed: &[u64], added: Vec<SsTable>) -> Vec<SsTable> {
        let added_generations: Vec<u64> = added.iter().map(SsTable::generation).collect();
        let dropped = self.mutate(|view| {
            let mut dropped = Vec::new();
            view.live.retain(|t| {
                if removed.contains(&t.generation()) {
                    dropped.push(t.clone());
                    false
                } else {
                    true
                }
            });
            view.live.extend(added.iter().cloned());
            for generation in removed {
                view.compacting.remove(generation);
            }
            dropped
        });
        self.notify(Notification::ListChanged {
            added: added_generations,
            removed: removed.to_vec(),
        });
        dropped
    }

    /// Drops live files matching `predicate` (truncation, cleanup). Returns
    /// the dropped handles.
    pub fn drop_sstables(&self, predicate: impl Fn(&SsTable) -> bool) -> Vec<SsTable> {
        let dropped = self.mutate(|view| {
            let mut dropped = Vec::new();
            view.live.retain(|t| {
                if predicate(t) {
                    dropped.push(t.clone());
                    false
                } else {
                    true
                }
            });
            dropped
        });
        if !dropped.is_empty() {
            self.notify(Notification::ListChanged {
                added: Vec::new(),
                removed: dropped.iter().map(SsTable::generation).collect(),
            });
        }
        dropped
    }

    /// Reserves `generations` for a compaction. Fails without reserving
    /// anything if any of them is already taken or no longer live.
    pub fn try_mark_compacting(&self, generations: &[u64]) -> bool {
        self.mutate(|view| {
            let all_live = generations
                .iter()
                .all(|g| view.live.iter().any(|t| t.generation() == *g));
            if !all_live || generations.iter().any(|g| view.compacting.contains(g)) {
                return false;
            }
            view.compacting.extend(generations.iter().copied());
            true
        })
    }

    pub fn unmark_compacting(&self, generations: &[u64]) {
        self.mutate(|view| {
            for generation in generations {
                view.compacting.remove(generation);
            }
        });
    }

    /// Empties the table: fresh memtable, no flushing memtables, no live
    /// files. Returns everything that was dropped.
    pub fn reset(&self, new: Arc<Memtable>) -> (Vec<Arc<Memtable>>, Vec<SsTable>) {
        let dropped = self.mutate(|view| {
            view.current = Arc::clone(&new);
            let memtables = std::mem::take(&mut view.flushing);
            let tables = std::mem::take(&mut view.live);
            view.compacting.clear();
            (memtables, tables)
        });
        self.notify(Notification::MemtableRenewed);
        dropped
    }

    pub fn notify_truncated(&self, truncated_at: i64) {
        self.notify(Notification::TruncationRecorded { truncated_at });
    }

    pub fn notify_discarded(&self) {
        self.notify(Notification::MemtableDiscarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::ReplayPosition;
    use crate::schema::{TableId, TableSchema};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memtable() -> Arc<Memtable> {
        let schema = Arc::new(TableSchema::new("ks", "t", TableId(1)));
        Arc::new(Memtable::new(
            schema,
            Arc::new(crate::memtable::LogPositionBound::new(ReplayPosition::NONE)),
            1 << 20,
        ))
    }

    #[test]
    fn test_switch_moves_old_to_flushing() {
        let tracker = Tracker::new(memtable());
        let replacement = memtable();
        let old = tracker.switch_memtable(false, Arc::clone(&replacement));

        let view = tracker.view();
        assert!(Arc::ptr_eq(&view.current, &replacement));
        assert_eq!(view.flushing.len(), 1);
        assert!(Arc::ptr_eq(&view.flushing[0], &old));
    }

    #[test]
    fn test_truncating_switch_discards_old() {
        let tracker = Tracker::new(memtable());
        tracker.switch_memtable(true, memtable());
        assert!(tracker.view().flushing.is_empty());
    }

    #[test]
    fn test_readers_keep_their_view() {
        let tracker = Tracker::new(memtable());
        let before = tracker.view();
        let old = tracker.switch_memtable(false, memtable());

        // The captured view still points at the old memtable.
        assert!(Arc::ptr_eq(&before.current, &old));
        assert!(!Arc::ptr_eq(&tracker.view().current, &old));
    }

    #[test]
    fn test_replace_flushed_is_atomic() {
        let tracker = Tracker::new(memtable());
        let old = tracker.switch_memtable(false, memtable());
        assert_eq!(tracker.view().flushing.len(), 1);

        tracker.replace_flushed(&old, Vec::new());
        let view = tracker.view();
        assert!(view.flushing.is_empty());
    }

    #[test]
    fn test_compacting_reservation() {
        let tracker = Tracker::new(memtable());
        // Nothing live: reservation of unknown generations fails.
        assert!(!tracker.try_mark_compacting(&[1]));

        // Reserving an empty set trivially succeeds.
        assert!(tracker.try_mark_compacting(&[]));
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let tracker = Tracker::new(memtable());
        let switches = Arc::new(AtomicUsize::new(0));
        let switches2 = Arc::clone(&switches);
        tracker.subscribe(Box::new(move |n| {
            if matches!(n, Notification::MemtableSwitched) {
                switches2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tracker.switch_memtable(false, memtable());
        tracker.switch_memtable(false, memtable());
        assert_eq!(switches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_empties_everything() {
        let tracker = Tracker::new(memtable());
        tracker.switch_memtable(false, memtable());
        let (memtables, tables) = tracker.reset(memtable());
        assert_eq!(memtables.len(), 1);
        assert!(tables.is_empty());

        let view = tracker.view();
        assert!(view.flushing.is_empty());
        assert!(view.live.is_empty());
    }
}
