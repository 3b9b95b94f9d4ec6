//! Snapshots: hard-link trees of the live sorted files.
//!
//! A snapshot hard-links every component of every live file into
//! `<table-dir>/snapshots/<tag>/` in the directory the file lives in,
//! writes a JSON manifest naming the linked files, and drops a
//! schema-reproducing CQL file alongside. Ephemeral snapshots leave a
//! marker and are cleaned up on the next startup. Link creation is
//! rate-limited.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{write_err, Result};
use crate::flush::FlushReason;
use crate::sstable::Component;

use super::TableStore;

const MANIFEST_FILE: &str = "manifest.json";
const SCHEMA_FILE: &str = "schema.cql";
const EPHEMERAL_MARKER: &str = "ephemeral.snapshot";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub files: Vec<String>,
}

/// Hard-links-per-second throttle.
struct LinkLimiter {
    per_second: u32,
    window_start: Instant,
    links_in_window: u32,
}

impl LinkLimiter {
    fn new(per_second: u32) -> Self {
        Self {
            per_second: per_second.max(1),
            window_start: Instant::now(),
            links_in_window: 0,
        }
    }

    fn acquire(&mut self) {
        self.links_in_window += 1;
        if self.links_in_window >= self.per_second {
            let elapsed = self.window_start.elapsed();
            if elapsed < Duration::from_secs(1) {
                std::thread::sleep(Duration::from_secs(1) - elapsed);
            }
            self.window_start = Instant::now();
            self.links_in_window = 0;
        }
    }
}

impl TableStore {
    /// Takes a snapshot under `tag`. Flushes first so the snapshot covers
    /// everything written before the call. Returns the snapshot directories
    /// created, one per data directory that held files.
    pub fn snapshot(self: &Arc<Self>, tag: &str, ephemeral: bool) -> Result<Vec<PathBuf>> {
        self.flush(FlushReason::Snapshot)?.wait()?;

        let mut limiter = LinkLimiter::new(self.context().config.snapshot_links_per_second);
        let view = self.tracker().view();
        let mut created: Vec<PathBuf> = Vec::new();
        let mut manifest_files: Vec<String> = Vec::new();

        for sstable in &view.live {
            let descriptor = sstable.descriptor();
            let snap_dir = descriptor.dir.join("snapshots").join(tag);
            std::fs::create_dir_all(&snap_dir).map_err(write_err)?;
            if !created.contains(&snap_dir) {
                created.push(snap_dir.clone());
            }
            for component in Component::ALL {
                let source = descriptor.path(component);
                let target = snap_dir.join(descriptor.filename(component));
                limiter.acquire();
                match std::fs::hard_link(&source, &target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(write_err(e)),
                }
            }
            manifest_files.push(descriptor.filename(Component::Data));
        }

        // Empty tables still get a snapshot directory with a manifest.
        if created.is_empty() {
            let snap_dir = self.directories()[0].join("snapshots").join(tag);
            std::fs::create_dir_all(&snap_dir).map_err(write_err)?;
            created.push(snap_dir);
        }

        let manifest = SnapshotManifest {
            files: manifest_files,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        for dir in &created {
            std::fs::write(dir.join(MANIFEST_FILE), &manifest_json).map_err(write_err)?;
            std::fs::write(dir.join(SCHEMA_FILE), self.schema().to_cql()).map_err(write_err)?;
            if ephemeral {
                std::fs::write(dir.join(EPHEMERAL_MARKER), b"").map_err(write_err)?;
            }
        }

        tracing::info!(
            table = %self.schema().qualified_name(),
            tag,
            files = manifest.files.len(),
            ephemeral,
            "snapshot created"
        );
        Ok(created)
    }

    /// Snapshot directories currently present for this table.
    pub fn list_snapshots(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        for dir in self.directories() {
            let snapshots = dir.join("snapshots");
            if !snapshots.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&snapshots)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    let tag = entry.file_name().to_string_lossy().into_owned();
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
            }
        }
        tags.sort();
        Ok(tags)
    }
}

/// Deletes ephemeral snapshots left behind by a previous process. Runs at
/// table open.
pub fn clear_ephemeral_snapshots(table_dir: &Path) -> Result<()> {
    let snapshots = table_dir.join("snapshots");
    if !snapshots.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&snapshots)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && path.join(EPHEMERAL_MARKER).exists() {
            tracing::info!(path = %path.display(), "removing ephemeral snapshot");
            std::fs::remove_dir_all(&path).map_err(write_err)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineContext;
    use crate::partition::clustering::Clustering;
    use crate::partition::update::{Cell, PartitionUpdate, Row};
    use crate::schema::{TableId, TableSchema};
    use crate::testdir::TempDir;

    fn open_table(dir: &TempDir) -> Arc<TableStore> {
        let ctx = EngineContext::new(EngineConfig::new(dir.path()));
        let schema = TableSchema::new("ks", "t", TableId(1)).column(0, "v");
        let table = TableStore::open(Arc::clone(&ctx), schema, None).unwrap();
        ctx.schema.register(Arc::clone(&table));
        table
    }

    fn put(table: &Arc<TableStore>, raw: &[u8]) {
        let key = table.decorate_key(raw.to_vec());
        let mut update = PartitionUpdate::new(table.id(), key);
        update.add_row(
            Row::new(Clustering::row(vec![b"c".to_vec()])).cell(0, Cell::live(1, b"v".to_vec())),
        );
        table.apply_update(&update).unwrap();
    }

    #[test]
    fn test_snapshot_links_and_manifest() {
        let dir = TempDir::new().unwrap();
        let table = open_table(&dir);
        for i in 0..10u8 {
            put(&table, &[i]);
        }

        let dirs = table.snapshot("backup-1", false).unwrap();
        assert!(!dirs.is_empty());

        let manifest: SnapshotManifest = serde_json::from_str(
            &std::fs::read_to_string(dirs[0].join(MANIFEST_FILE)).unwrap(),
        )
        .unwrap();
        assert!(!manifest.files.is_empty());
        for file in &manifest.files {
            assert!(dirs.iter().any(|d| d.join(file).exists()));
        }
        let cql = std::fs::read_to_string(dirs[0].join(SCHEMA_FILE)).unwrap();
        assert!(cql.contains("CREATE TABLE ks.t"));

        assert_eq!(table.list_snapshots().unwrap(), vec!["backup-1".to_string()]);
    }

    #[test]
    fn test_snapshot_survives_file_obsoletion() {
        let dir = TempDir::new().unwrap();
        let table = open_table(&dir);
        for i in 0..10u8 {
            put(&table, &[i]);
        }
        let dirs = table.snapshot("keep", false).unwrap();
        let manifest: SnapshotManifest = serde_json::from_str(
            &std::fs::read_to_string(dirs[0].join(MANIFEST_FILE)).unwrap(),
        )
        .unwrap();

        // Obsolete and drop every live file; hard links must keep bytes.
        let dropped = table.tracker().drop_sstables(|_| true);
        for t in &dropped {
            t.mark_obsolete();
        }
        drop(dropped);

        for file in &manifest.files {
            assert!(
                dirs.iter().any(|d| d.join(file).exists()),
                "snapshot link for {file} must survive"
            );
        }
    }

    #[test]
    fn test_ephemeral_snapshot_cleared_on_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let table = open_table(&dir);
            put(&table, b"k");
            let dirs = table.snapshot("temp", true).unwrap();
            assert!(dirs[0].join(EPHEMERAL_MARKER).exists());
        }

        // Reopening the table clears ephemeral snapshots.
        let table = open_table(&dir);
        assert!(table.list_snapshots().unwrap().is_empty());
    }
}
