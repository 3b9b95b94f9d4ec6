//! Immutable sorted files and their lifecycle.
//!
//! A sorted file is sealed once written: after that it only ever gets
//! opened, scanned, point-queried, and eventually obsoleted. The handle
//! here is reference counted; the bytes on disk outlive the last holder
//! only while the file has not been marked obsolete. A file that is both
//! obsolete and unreferenced is deleted as the final reference drops.

pub mod descriptor;
pub mod filter;
pub mod format;
pub mod metadata;

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::partition::key::PartitionKey;
use crate::partition::update::PartitionUpdate;

pub use descriptor::{Component, Descriptor, SsTableFormat};
pub use filter::BloomFilter;
pub use format::{FlatReader, FlatScanner, FlatWriter};
pub use metadata::{StatsMetadata, UNREPAIRED};

pub type KeyBounds = (Bound<PartitionKey>, Bound<PartitionKey>);

/// Format-dispatched reader. The format set is closed, so dispatch is an
/// enum rather than a trait object.
enum ReaderImpl {
    Flat(FlatReader),
}

struct Inner {
    descriptor: Descriptor,
    reader: ReaderImpl,
    obsolete: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::SeqCst) {
            return;
        }
        // Last holder of an obsolete file reclaims its bytes.
        for component in Component::ALL {
            let path = self.descriptor.path(component);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete obsolete component");
                }
            }
        }
        tracing::debug!(
            generation = self.descriptor.generation,
            "deleted obsolete sorted file"
        );
    }
}

/// Shared handle to a sealed sorted file. Cloning acquires a reference;
/// dropping releases it.
#[derive(Clone)]
pub struct SsTable {
    inner: Arc<Inner>,
}

impl SsTable {
    /// Opens a sealed file. `crc_check_chance` is the probability each read
    /// verifies record checksums.
    pub fn open(descriptor: Descriptor, crc_check_chance: f64) -> Result<Self> {
        let reader = match descriptor.format {
            SsTableFormat::Flat => {
                ReaderImpl::Flat(FlatReader::open(descriptor.clone(), crc_check_chance)?)
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                descriptor,
                reader,
                obsolete: AtomicBool::new(false),
            }),
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.inner.descriptor
    }

    pub fn generation(&self) -> u64 {
        self.inner.descriptor.generation
    }

    pub fn stats(&self) -> &StatsMetadata {
        match &self.inner.reader {
            ReaderImpl::Flat(reader) => reader.stats(),
        }
    }

    pub fn get(&self, key: &PartitionKey) -> Result<Option<PartitionUpdate>> {
        match &self.inner.reader {
            ReaderImpl::Flat(reader) => reader.get(key),
        }
    }

    pub fn scan(&self, range: KeyBounds) -> Result<SsTableScanner> {
        match &self.inner.reader {
            ReaderImpl::Flat(reader) => Ok(SsTableScanner::Flat(reader.scan(range)?)),
        }
    }

    /// Marks the bytes reclaimable once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.inner.obsolete.store(true, Ordering::SeqCst);
    }

    pub fn is_obsolete(&self) -> bool {
        self.inner.obsolete.load(Ordering::SeqCst)
    }

    /// Number of live references, the tracker's included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether this file's key interval intersects `range`.
    pub fn intersects(&self, range: &KeyBounds) -> bool {
        self.stats().intersects(&range.0, &range.1)
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("generation", &self.generation())
            .field("entries", &self.stats().entry_count)
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}

/// Scanner over one sorted file, dispatched by format.
pub enum SsTableScanner {
    Flat(FlatScanner),
}

impl Iterator for SsTableScanner {
    type Item = Result<PartitionUpdate>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SsTableScanner::Flat(scanner) => scanner.next(),
        }
    }
}

/// Removes every component of an unsealed or rolled-back file. Missing
/// components are fine; this must be idempotent for crash recovery.
pub fn delete_components(descriptor: &Descriptor) {
    for component in Component::ALL {
        let path = descriptor.path(component);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete component");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::clustering::Clustering;
    use crate::partition::key::HashPartitioner;
    use crate::partition::update::{Cell, Row};
    use crate::schema::TableId;
    use crate::testdir::TempDir;

    fn build_table(dir: &TempDir, generation: u64, keys: &[&[u8]]) -> SsTable {
        let descriptor = Descriptor::new(dir.path(), SsTableFormat::Flat, generation);
        let mut updates: Vec<_> = keys
            .iter()
            .map(|raw| {
                let key = PartitionKey::new(&HashPartitioner, raw.to_vec());
                let mut u = PartitionUpdate::new(TableId(1), key);
                u.add_row(
                    Row::new(Clustering::row(vec![b"c".to_vec()]))
                        .cell(0, Cell::live(1, raw.to_vec())),
                );
                u
            })
            .collect();
        updates.sort_by(|a, b| a.key().cmp(b.key()));

        let mut writer = FlatWriter::create(descriptor.clone(), updates.len()).unwrap();
        for u in &updates {
            writer.append(u).unwrap();
        }
        writer.finish(UNREPAIRED, None).unwrap();
        SsTable::open(descriptor, 1.0).unwrap()
    }

    #[test]
    fn test_obsolete_with_refs_keeps_bytes() {
        let dir = TempDir::new().unwrap();
        let table = build_table(&dir, 1, &[b"a", b"b"]);
        let data_path = table.descriptor().path(Component::Data);

        let extra_ref = table.clone();
        table.mark_obsolete();
        drop(table);
        assert!(
            data_path.exists(),
            "bytes must survive while a reference is held"
        );

        drop(extra_ref);
        assert!(!data_path.exists(), "last drop of an obsolete file deletes");
    }

    #[test]
    fn test_not_obsolete_never_deleted() {
        let dir = TempDir::new().unwrap();
        let data_path;
        {
            let table = build_table(&dir, 1, &[b"a"]);
            data_path = table.descriptor().path(Component::Data);
        }
        assert!(data_path.exists(), "live files survive handle drops");
    }

    #[test]
    fn test_ref_count_tracks_clones() {
        let dir = TempDir::new().unwrap();
        let table = build_table(&dir, 1, &[b"a"]);
        assert_eq!(table.ref_count(), 1);
        let clone = table.clone();
        assert_eq!(table.ref_count(), 2);
        drop(clone);
        assert_eq!(table.ref_count(), 1);
    }

    #[test]
    fn test_reopen_after_seal() {
        let dir = TempDir::new().unwrap();
        let table = build_table(&dir, 3, &[b"x", b"y"]);
        let descriptor = table.descriptor().clone();
        drop(table);

        let reopened = SsTable::open(descriptor, 1.0).unwrap();
        assert_eq!(reopened.stats().entry_count, 2);
        let key = PartitionKey::new(&HashPartitioner, b"x".to_vec());
        assert!(reopened.get(&key).unwrap().is_some());
    }

    #[test]
    fn test_delete_components_idempotent() {
        let dir = TempDir::new().unwrap();
        let table = build_table(&dir, 1, &[b"a"]);
        let descriptor = table.descriptor().clone();
        drop(table);

        delete_components(&descriptor);
        delete_components(&descriptor);
        assert!(!descriptor.path(Component::Data).exists());
    }
}
