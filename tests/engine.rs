//! End-to-end scenarios over the assembled engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tephra::compaction::StopTrigger;
use tephra::engine::Engine;
use tephra::flush::FlushReason;
use tephra::lifecycle::{LifecycleTransaction, OperationType};
use tephra::partition::clustering::Clustering;
use tephra::partition::update::{Cell, DeletionTime, PartitionUpdate, Row};
use tephra::read::ReadCommand;
use tephra::schema::{TableId, TableSchema};
use tephra::sstable::{FlatWriter, SsTableFormat, UNREPAIRED};
use tephra::table::TableStore;
use tephra::testdir::TempDir;
use tephra::{EngineConfig, Mutation};

fn new_engine(dir: &TempDir) -> Engine {
    Engine::open(EngineConfig::new(dir.path())).unwrap()
}

fn table_schema() -> TableSchema {
    TableSchema::new("ks", "events", TableId(1)).column(0, "payload")
}

fn mutation(table: &Arc<TableStore>, raw: &[u8], clustering: &[u8], ts: i64, value: &[u8]) -> Mutation {
    let key = table.decorate_key(raw.to_vec());
    let mut update = PartitionUpdate::new(table.id(), key.clone());
    update.add_row(
        Row::new(Clustering::row(vec![clustering.to_vec()]))
            .cell(0, Cell::live(ts, value.to_vec())),
    );
    Mutation::new("ks", key).with(update).unwrap()
}

fn scan(table: &Arc<TableStore>) -> Vec<tephra::ReadPartition> {
    table
        .read(ReadCommand::full_scan(table.id()))
        .unwrap()
        .collect::<tephra::Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn round_trip_put_scan_overwrite_tombstone() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let table = engine.create_table(table_schema()).unwrap();

    // Insert (k=1, c=1, v=1) and scan it back.
    engine.apply(&mutation(&table, b"1", b"1", 10, b"1")).unwrap();
    let result = scan(&table);
    assert_eq!(result.len(), 1);
    assert_eq!(
        result[0].rows[0].cells[&0].value.as_deref(),
        Some(b"1".as_ref())
    );

    // A newer timestamp overwrites.
    engine.apply(&mutation(&table, b"1", b"1", 20, b"2")).unwrap();
    let result = scan(&table);
    assert_eq!(
        result[0].rows[0].cells[&0].value.as_deref(),
        Some(b"2".as_ref())
    );

    // A tombstone at the same timestamp beats the value.
    let key = table.decorate_key(b"1".to_vec());
    let mut del = PartitionUpdate::new(table.id(), key.clone());
    del.add_row(Row::new(Clustering::row(vec![b"1".to_vec()])).cell(0, Cell::tombstone(20, 1000)));
    engine
        .apply(&Mutation::new("ks", key).with(del).unwrap())
        .unwrap();
    assert!(scan(&table).is_empty());
}

#[test]
fn flush_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let table = engine.create_table(table_schema()).unwrap();

    for i in 0..1000u32 {
        engine
            .apply(&mutation(&table, &i.to_be_bytes(), b"c", 1, b"v"))
            .unwrap();
    }
    table.flush(FlushReason::UserForced).unwrap().wait().unwrap();
    // The second flush is a no-op: the fresh memtable is clean.
    table.flush(FlushReason::UserForced).unwrap().wait().unwrap();

    let view = table.tracker().view();
    assert_eq!(view.live.len(), 1, "exactly one sorted file");
    assert_eq!(scan(&table).len(), 1000, "same content after both flushes");
}

#[test]
fn crash_between_prepare_and_commit_is_atomic() {
    let dir = TempDir::new().unwrap();

    // Build {A, B} through two flushes, then a merged output C, and crash
    // right after prepare_to_commit.
    {
        let engine = new_engine(&dir);
        let table = engine.create_table(table_schema()).unwrap();
        for i in 0..10u8 {
            engine.apply(&mutation(&table, &[i], b"c", 1, b"v")).unwrap();
        }
        table.flush(FlushReason::UserForced).unwrap().wait().unwrap();
        for i in 10..20u8 {
            engine.apply(&mutation(&table, &[i], b"c", 1, b"v")).unwrap();
        }
        table.flush(FlushReason::UserForced).unwrap().wait().unwrap();

        let view = table.tracker().view();
        assert_eq!(view.live.len(), 2);
        let inputs = view.live.clone();
        assert!(table.tracker().try_mark_compacting(
            &inputs.iter().map(|t| t.generation()).collect::<Vec<_>>()
        ));

        // Write the merged output C by hand, in key order.
        let out_descriptor = tephra::sstable::Descriptor::new(
            table.directories()[0].clone(),
            SsTableFormat::Flat,
            table.next_generation(),
        );
        let mut merged: Vec<PartitionUpdate> = Vec::new();
        for input in &inputs {
            for update in input
                .scan((std::ops::Bound::Unbounded, std::ops::Bound::Unbounded))
                .unwrap()
            {
                merged.push(update.unwrap());
            }
        }
        merged.sort_by(|a, b| a.key().cmp(b.key()));
        let mut writer = FlatWriter::create(out_descriptor.clone(), merged.len()).unwrap();
        for update in &merged {
            writer.append(update).unwrap();
        }
        writer.finish(UNREPAIRED, None).unwrap();

        let mut txn = LifecycleTransaction::new(
            Arc::clone(table.tracker()),
            OperationType::Compaction,
            &table.directories()[0],
            inputs,
            1.0,
        );
        txn.track_new(out_descriptor);
        txn.prepare_to_commit().unwrap();
        // The "crash": the transaction vanishes without commit or abort,
        // leaving its log on disk.
        std::mem::forget(txn);
    }

    // Restart: recovery must leave either {A,B} or {C}, never a mixture.
    let engine = new_engine(&dir);
    let table = engine.create_table(table_schema()).unwrap();
    let generations = table.tracker().view().live_generations();
    assert!(
        generations.len() == 1 || generations.len() == 2,
        "view is {{A,B}} or {{C}}, found {generations:?}"
    );
    assert_eq!(scan(&table).len(), 20, "content identical either way");
}

#[test]
fn barrier_splits_writers_without_tearing() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(new_engine(&dir));
    let table = engine.create_table(table_schema()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..10u8 {
        let engine = Arc::clone(&engine);
        let table = Arc::clone(&table);
        let stop = Arc::clone(&stop);
        writers.push(std::thread::spawn(move || {
            let mut written = 0u32;
            while !stop.load(Ordering::SeqCst) && written < 50_000 {
                // One mutation with two rows: it must never be split across
                // the memtable switch.
                let raw = [w, written.to_be_bytes()[2], written.to_be_bytes()[3]];
                let key = table.decorate_key(raw.to_vec());
                let mut update = PartitionUpdate::new(table.id(), key.clone());
                update.add_row(
                    Row::new(Clustering::row(vec![b"a".to_vec()])).cell(0, Cell::live(1, b"v".to_vec())),
                );
                update.add_row(
                    Row::new(Clustering::row(vec![b"b".to_vec()])).cell(0, Cell::live(1, b"v".to_vec())),
                );
                engine
                    .apply(&Mutation::new("ks", key).with(update).unwrap())
                    .unwrap();
                written += 1;
            }
            written
        }));
    }

    // Switch memtables underneath the writers a few times.
    for _ in 0..5 {
        std::thread::sleep(std::time::Duration::from_millis(10));
        table.flush(FlushReason::UserForced).unwrap().wait().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    let total: u32 = writers.into_iter().map(|w| w.join().unwrap()).sum();
    table.flush(FlushReason::UserForced).unwrap().wait().unwrap();

    let partitions = scan(&table);
    assert_eq!(partitions.len() as u32, total);
    for partition in &partitions {
        assert_eq!(
            partition.rows.len(),
            2,
            "mutation for {:?} was torn by a memtable switch",
            partition.key
        );
    }
}

#[test]
fn truncate_with_snapshot() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let table = engine.create_table(table_schema()).unwrap();

    // Partitions spread across several memtables and files.
    for batch in 0..3u8 {
        for i in 0..20u8 {
            engine
                .apply(&mutation(&table, &[batch, i], b"c", 1, b"v"))
                .unwrap();
        }
        if batch < 2 {
            table.flush(FlushReason::UserForced).unwrap().wait().unwrap();
        }
    }
    assert_eq!(scan(&table).len(), 60);

    table.truncate(true).unwrap();

    assert!(scan(&table).is_empty(), "full scan returns nothing");
    assert!(table.tracker().view().live.is_empty(), "all files dropped");

    // The snapshot preserves all 60 partitions' worth of files.
    let tags = table.list_snapshots().unwrap();
    assert_eq!(tags.len(), 1);
    let snap_dir = table.directories()[0].join("snapshots").join(&tags[0]);
    let manifest: tephra::table::SnapshotManifest =
        serde_json::from_str(&std::fs::read_to_string(snap_dir.join("manifest.json")).unwrap())
            .unwrap();
    assert!(!manifest.files.is_empty());
    for file in &manifest.files {
        assert!(snap_dir.join(file).exists());
    }

    // Data age gates the drop: writes after truncation survive.
    engine.apply(&mutation(&table, b"post", b"c", 9, b"v")).unwrap();
    assert_eq!(scan(&table).len(), 1);
}

#[test]
fn reads_see_full_content_during_compaction() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(new_engine(&dir));
    let mut schema = table_schema();
    schema.params.min_compaction_threshold = 2;
    let table = engine.create_table(schema).unwrap();

    // 2000 rows across 4 files.
    for batch in 0..4u16 {
        for i in 0..500u16 {
            let raw = (batch * 500 + i).to_be_bytes();
            engine.apply(&mutation(&table, &raw, b"c", 1, b"v")).unwrap();
        }
        table.flush(FlushReason::UserForced).unwrap().wait().unwrap();
    }
    assert_eq!(table.tracker().view().live.len(), 4);

    let compactor = {
        let ctx = Arc::clone(engine.context());
        let table = Arc::clone(&table);
        std::thread::spawn(move || ctx.compaction.perform_maximal(&table, false))
    };

    // Concurrent scans must always see every row, whichever side of the
    // swap they land on.
    for _ in 0..20 {
        assert_eq!(scan(&table).len(), 2000);
    }
    compactor.join().unwrap().unwrap();
    assert_eq!(table.tracker().view().live.len(), 1);
    assert_eq!(scan(&table).len(), 2000);
}

#[test]
fn compaction_purges_expired_tombstones() {
    let dir = TempDir::new().unwrap();
    let engine = new_engine(&dir);
    let mut schema = table_schema();
    schema.params.gc_grace = std::time::Duration::ZERO;
    schema.params.min_compaction_threshold = 2;
    let table = engine.create_table(schema).unwrap();

    engine.apply(&mutation(&table, b"k", b"c", 10, b"v")).unwrap();
    table.flush(FlushReason::UserForced).unwrap().wait().unwrap();

    // Delete with an ancient local deletion time, flush to a second file.
    let key = table.decorate_key(b"k".to_vec());
    let mut del = PartitionUpdate::new(table.id(), key.clone());
    del.delete_partition(DeletionTime::new(20, 1));
    engine
        .apply(&Mutation::new("ks", key).with(del).unwrap())
        .unwrap();
    table.flush(FlushReason::UserForced).unwrap().wait().unwrap();
    assert_eq!(table.tracker().view().live.len(), 2);

    engine
        .context()
        .compaction
        .perform_maximal(&table, false)
        .unwrap();

    // Value and tombstone annihilated: nothing live remains.
    let view = table.tracker().view();
    assert!(view.live.is_empty(), "fully purged output writes no file");
    assert!(scan(&table).is_empty());
}

#[test]
fn interrupted_compaction_keeps_inputs() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(new_engine(&dir));
    let table = engine.create_table(table_schema()).unwrap();

    for batch in 0..2u8 {
        for i in 0..200u8 {
            engine
                .apply(&mutation(&table, &[batch, i], b"c", 1, b"v"))
                .unwrap();
        }
        table.flush(FlushReason::UserForced).unwrap().wait().unwrap();
    }
    let before = table.tracker().view().live_generations();

    // Interrupt everything on this table, then race a maximal compaction
    // against the interruption; whichever way the race lands, either the
    // old or the new file set serves the full content.
    let ctx = Arc::clone(engine.context());
    let interruptor = {
        let ctx = Arc::clone(&ctx);
        let id = table.id();
        std::thread::spawn(move || {
            for _ in 0..100 {
                ctx.compaction.interrupt_for(&[id], |_| true, true, StopTrigger::UnitTests);
                std::thread::yield_now();
            }
        })
    };
    let _ = ctx.compaction.perform_maximal(&table, false);
    interruptor.join().unwrap();
    ctx.compaction.wait_for_cessation(&[table.id()], |_| true);

    let after = table.tracker().view().live_generations();
    assert!(
        after == before || after.len() == 1,
        "inputs intact or swap completed, found {after:?}"
    );
    assert_eq!(scan(&table).len(), 400);
}
