//! Write / flush / compact / scan micro-benchmark over the embedded engine.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use tephra::engine::Engine;
use tephra::flush::FlushReason;
use tephra::partition::clustering::Clustering;
use tephra::partition::update::{Cell, PartitionUpdate, Row};
use tephra::read::ReadCommand;
use tephra::schema::{TableId, TableSchema};
use tephra::table::TableStore;
use tephra::testdir::TempDir;
use tephra::{EngineConfig, Mutation};

const NUM_PARTITIONS: u64 = 200_000;
const VALUE_SIZE: usize = 100;
const BATCHES: u64 = 8;

fn print_arguments() {
    println!("tephra: version {}", env!("CARGO_PKG_VERSION"));
    println!("Partitions: {NUM_PARTITIONS}");
    println!("Values: {VALUE_SIZE} bytes each");
    println!(
        "RawSize: {:.1} MB (estimated)",
        ((8 + VALUE_SIZE) as u64 * NUM_PARTITIONS) as f64 / 1024.0 / 1024.0
    );
    println!("Batches: {BATCHES} (one flush each)");
}

struct Bench {
    _temp_dir: TempDir,
    engine: Engine,
    table: Arc<TableStore>,
}

impl Bench {
    fn new() -> Bench {
        let temp_dir = TempDir::new().expect("temp dir");
        let engine = Engine::open(EngineConfig::new(temp_dir.path())).expect("open engine");
        let mut schema = TableSchema::new("bench", "kv", TableId(1)).column(0, "value");
        schema.params.min_compaction_threshold = 2;
        let table = engine.create_table(schema).expect("create table");
        Bench {
            _temp_dir: temp_dir,
            engine,
            table,
        }
    }

    fn fill(&self) {
        let mut rng = rand::thread_rng();
        let value: Vec<u8> = (0..VALUE_SIZE).map(|_| rng.gen()).collect();
        let per_batch = NUM_PARTITIONS / BATCHES;

        let start = Instant::now();
        for batch in 0..BATCHES {
            for i in 0..per_batch {
                let raw = (batch * per_batch + i).to_be_bytes();
                let key = self.table.decorate_key(raw.to_vec());
                let mut update = PartitionUpdate::new(self.table.id(), key.clone());
                update.add_row(
                    Row::new(Clustering::row(vec![b"c".to_vec()]))
                        .cell(0, Cell::live(1, value.clone())),
                );
                self.engine
                    .apply(&Mutation::new("bench", key).with(update).unwrap())
                    .expect("apply");
            }
            self.table
                .flush(FlushReason::UserForced)
                .expect("flush")
                .wait()
                .expect("flush wait");
        }
        let elapsed = start.elapsed();
        println!(
            "fill+flush: {:.2}s ({:.0} writes/s, {} files)",
            elapsed.as_secs_f64(),
            NUM_PARTITIONS as f64 / elapsed.as_secs_f64(),
            self.table.tracker().view().live.len()
        );
    }

    fn compact(&self) {
        let start = Instant::now();
        self.engine
            .context()
            .compaction
            .perform_maximal(&self.table, false)
            .expect("compaction");
        println!(
            "compact: {:.2}s ({} files after)",
            start.elapsed().as_secs_f64(),
            self.table.tracker().view().live.len()
        );
    }

    fn scan(&self) {
        let start = Instant::now();
        let count = self
            .table
            .read(ReadCommand::full_scan(self.table.id()))
            .expect("scan")
            .count();
        let elapsed = start.elapsed();
        println!(
            "scan: {:.2}s ({} partitions, {:.0} partitions/s)",
            elapsed.as_secs_f64(),
            count,
            count as f64 / elapsed.as_secs_f64()
        );
        assert_eq!(count as u64, NUM_PARTITIONS);
    }

    fn point_reads(&self, samples: u64) {
        let mut rng = rand::thread_rng();
        let start = Instant::now();
        for _ in 0..samples {
            let raw = rng.gen_range(0..NUM_PARTITIONS).to_be_bytes();
            let key = self.table.decorate_key(raw.to_vec());
            let found = self
                .table
                .get(&ReadCommand::point(self.table.id(), key))
                .expect("point read");
            assert!(found.is_some());
        }
        let elapsed = start.elapsed();
        println!(
            "point reads: {:.2}s ({:.0} reads/s over {samples} samples)",
            elapsed.as_secs_f64(),
            samples as f64 / elapsed.as_secs_f64()
        );
    }
}

fn main() {
    print_arguments();
    let bench = Bench::new();
    bench.fill();
    bench.scan();
    bench.point_reads(10_000);
    bench.compact();
    bench.scan();
}
