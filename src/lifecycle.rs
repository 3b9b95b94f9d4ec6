//! Crash-safe multi-file swaps.
//!
//! Replacing sorted files (flush making new ones live, compaction swapping
//! inputs for outputs) must be atomic across crashes. Each operation writes
//! a small transaction log next to the data files:
//!
//! ```text
//! ADD:<data-filename>:<size>:<crc32>
//! REMOVE:<data-filename>:0:<crc32>
//! COMMIT:<record-count>:<crc32-of-all-records>
//! ```
//!
//! Every record line carries its own checksum; the final `COMMIT` line
//! checksums the whole body. A log on disk at startup means the operation
//! did not finish cleanly: a valid `COMMIT` line (or a complete set of
//! `ADD` files) rolls the swap forward, anything else rolls it back. Both
//! paths are idempotent, and no tracker view ever includes a half-sealed
//! file because files become live only after the log is committed.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc::{Crc, CRC_32_ISCSI};

use crate::error::{write_err, Error, Result};
use crate::memtable::Memtable;
use crate::sstable::{delete_components, Component, Descriptor, SsTable};
use crate::tracker::Tracker;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const LOG_PREFIX: &str = "txn-";
const LOG_SUFFIX: &str = ".log";

/// What kind of operation owns a transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Flush,
    Compaction,
    Cleanup,
    Truncate,
    Streaming,
}

impl OperationType {
    fn name(self) -> &'static str {
        match self {
            OperationType::Flush => "flush",
            OperationType::Compaction => "compaction",
            OperationType::Cleanup => "cleanup",
            OperationType::Truncate => "truncate",
            OperationType::Streaming => "streaming",
        }
    }
}

fn record_line(kind: &str, filename: &str, size: u64) -> String {
    let body = format!("{kind}:{filename}:{size}");
    let crc = CRC32.checksum(body.as_bytes());
    format!("{body}:{crc:08x}")
}

fn parse_record(line: &str) -> Option<(String, String, u64)> {
    let (body, crc_hex) = line.rsplit_once(':')?;
    let crc = u32::from_str_radix(crc_hex, 16).ok()?;
    if CRC32.checksum(body.as_bytes()) != crc {
        return None;
    }
    let mut parts = body.splitn(3, ':');
    let kind = parts.next()?.to_string();
    let filename = parts.next()?.to_string();
    let size = parts.next()?.parse().ok()?;
    Some((kind, filename, size))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TxnState {
    InProgress,
    Prepared,
    Finished,
}

/// A crash-safe "replace these files with those" operation. Owns its log
/// file until commit or abort; dropping an unfinished transaction aborts
/// it.
pub struct LifecycleTransaction {
    tracker: Arc<Tracker>,
    op: OperationType,
    log_path: PathBuf,
    inputs: Vec<SsTable>,
    outputs: Vec<Descriptor>,
    crc_check_chance: f64,
    state: TxnState,
}

impl LifecycleTransaction {
    /// Starts a transaction that will obsolete `inputs`. The inputs must
    /// already be reserved in the tracker (compacting set) by the caller
    /// when contention is possible.
    pub fn new(
        tracker: Arc<Tracker>,
        op: OperationType,
        dir: &Path,
        inputs: Vec<SsTable>,
        crc_check_chance: f64,
    ) -> Self {
        static NEXT_TXN_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let id = crate::sstable::format::wall_clock_millis();
        let seq = NEXT_TXN_SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let log_path = dir.join(format!("{LOG_PREFIX}{}-{id}-{seq}{LOG_SUFFIX}", op.name()));
        Self {
            tracker,
            op,
            log_path,
            inputs,
            outputs: Vec::new(),
            crc_check_chance,
            state: TxnState::InProgress,
        }
    }

    pub fn op(&self) -> OperationType {
        self.op
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Registers a sealed output file.
    pub fn track_new(&mut self, descriptor: Descriptor) {
        debug_assert_eq!(self.state, TxnState::InProgress);
        self.outputs.push(descriptor);
    }

    /// Writes the ADD and REMOVE records and fsyncs the log. Output files
    /// must be sealed (their writers fsynced) before this is called.
    pub fn prepare_to_commit(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, TxnState::InProgress);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.log_path)
            .map_err(write_err)?;
        let mut writer = BufWriter::new(file);

        // Outputs may live in a different data directory than the log (one
        // shard per disk), so records carry the full data path.
        for descriptor in &self.outputs {
            let data_path = descriptor.path(Component::Data);
            let size = std::fs::metadata(&data_path)
                .map_err(|e| Error::FsWrite(format!("output not sealed: {e}")))?
                .len();
            writeln!(
                writer,
                "{}",
                record_line("ADD", &data_path.to_string_lossy(), size)
            )
            .map_err(write_err)?;
        }
        for input in &self.inputs {
            writeln!(
                writer,
                "{}",
                record_line(
                    "REMOVE",
                    &input.descriptor().path(Component::Data).to_string_lossy(),
                    0
                )
            )
            .map_err(write_err)?;
        }
        writer.flush().map_err(write_err)?;
        writer.get_ref().sync_all().map_err(write_err)?;
        self.state = TxnState::Prepared;
        Ok(())
    }

    fn append_commit_record(&self) -> Result<()> {
        let body = std::fs::read_to_string(&self.log_path)?;
        let crc = CRC32.checksum(body.as_bytes());
        let records = body.lines().count();
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)
            .map_err(write_err)?;
        writeln!(file, "COMMIT:{records}:{crc:08x}").map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        Ok(())
    }

    fn open_outputs(&self) -> Result<Vec<SsTable>> {
        self.outputs
            .iter()
            .map(|d| SsTable::open(d.clone(), self.crc_check_chance))
            .collect()
    }

    fn finish(&mut self, inputs_dropped: Vec<SsTable>) {
        for table in &self.inputs {
            table.mark_obsolete();
        }
        drop(inputs_dropped);
        self.inputs.clear();
        if let Err(e) = std::fs::remove_file(&self.log_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.log_path.display(), error = %e, "failed to delete transaction log");
            }
        }
        self.state = TxnState::Finished;
    }

    /// Commits a compaction-style swap: outputs become live, inputs leave
    /// the live set and are obsoleted, the log disappears. Returns the new
    /// live handles.
    pub fn commit(mut self) -> Result<Vec<SsTable>> {
        debug_assert_eq!(self.state, TxnState::Prepared);
        self.append_commit_record()?;
        let outputs = self.open_outputs()?;
        let removed: Vec<u64> = self.inputs.iter().map(SsTable::generation).collect();
        let dropped = self.tracker.replace_sstables(&removed, outputs.clone());
        self.finish(dropped);
        Ok(outputs)
    }

    /// Commits a flush: the frozen memtable leaves the flushing list and
    /// the outputs become live in the same tracker transition.
    pub fn commit_flushed(mut self, flushed: &Arc<Memtable>) -> Result<Vec<SsTable>> {
        debug_assert_eq!(self.state, TxnState::Prepared);
        self.append_commit_record()?;
        let outputs = self.open_outputs()?;
        self.tracker.replace_flushed(flushed, outputs.clone());
        self.finish(Vec::new());
        Ok(outputs)
    }

    /// Deletes output files, keeps inputs live, removes the log.
    pub fn abort(&mut self) {
        if self.state == TxnState::Finished {
            return;
        }
        tracing::info!(op = self.op.name(), outputs = self.outputs.len(), "aborting lifecycle transaction");
        for descriptor in &self.outputs {
            delete_components(descriptor);
        }
        let generations: Vec<u64> = self.inputs.iter().map(SsTable::generation).collect();
        self.tracker.unmark_compacting(&generations);
        self.inputs.clear();
        if self.log_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.log_path) {
                tracing::warn!(path = %self.log_path.display(), error = %e, "failed to delete transaction log on abort");
            }
        }
        self.state = TxnState::Finished;
    }
}

impl Drop for LifecycleTransaction {
    fn drop(&mut self) {
        if self.state != TxnState::Finished {
            self.abort();
        }
    }
}

/// Outcome of replaying one transaction log at startup.
#[derive(Debug, PartialEq)]
pub enum RecoveryAction {
    RolledForward,
    RolledBack,
}

/// Resolves every transaction log in `dir`. Must run before sorted-file
/// discovery so that discovery only ever sees a consistent set.
pub fn recover_directory(dir: &Path) -> Result<Vec<RecoveryAction>> {
    let mut actions = Vec::new();
    if !dir.exists() {
        return Ok(actions);
    }
    let mut log_paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(LOG_PREFIX) && n.ends_with(LOG_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    log_paths.sort();

    for log_path in log_paths {
        actions.push(recover_log(dir, &log_path)?);
    }
    Ok(actions)
}

/// Resolves a record's file reference: a bare filename resolves against the
/// log's own directory, a full path against its parent.
fn descriptor_from_record(dir: &Path, name: &str) -> Option<Descriptor> {
    let path = Path::new(name);
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => Descriptor::parse(parent, path.file_name()?.to_str()?).map(|(d, _)| d),
        None => Descriptor::parse(dir, name).map(|(d, _)| d),
    }
}

fn recover_log(dir: &Path, log_path: &Path) -> Result<RecoveryAction> {
    let content = std::fs::read_to_string(log_path)?;
    let lines: Vec<&str> = content.lines().collect();

    let mut adds: Vec<(Descriptor, u64)> = Vec::new();
    let mut removes: Vec<Descriptor> = Vec::new();
    let mut committed = false;

    for (i, line) in lines.iter().enumerate() {
        let last = i + 1 == lines.len();
        // COMMIT checksums the body (all record lines plus newlines).
        if let Some(rest) = line.strip_prefix("COMMIT:") {
            let valid = rest.split_once(':').is_some_and(|(count, crc_hex)| {
                let body: String = lines[..i].iter().map(|l| format!("{l}\n")).collect();
                count.parse::<usize>().map(|c| c == i).unwrap_or(false)
                    && u32::from_str_radix(crc_hex, 16)
                        .map(|crc| crc == CRC32.checksum(body.as_bytes()))
                        .unwrap_or(false)
            });
            if valid && last {
                committed = true;
                break;
            }
            return Err(Error::StartupFailure(format!(
                "transaction log {} has an invalid commit record",
                log_path.display()
            )));
        }

        match parse_record(line) {
            Some((kind, filename, size)) => match kind.as_str() {
                "ADD" => {
                    let descriptor = descriptor_from_record(dir, &filename).ok_or_else(|| {
                        Error::StartupFailure(format!(
                            "transaction log names unparseable file {filename}"
                        ))
                    })?;
                    adds.push((descriptor, size));
                }
                "REMOVE" => {
                    let descriptor = descriptor_from_record(dir, &filename).ok_or_else(|| {
                        Error::StartupFailure(format!(
                            "transaction log names unparseable file {filename}"
                        ))
                    })?;
                    removes.push(descriptor);
                }
                other => {
                    return Err(Error::StartupFailure(format!(
                        "transaction log {} has unknown record kind {other}",
                        log_path.display()
                    )))
                }
            },
            None if last => {
                // A torn trailing line means the crash hit mid-prepare;
                // clearly pre-commit, so the roll-back below applies.
                break;
            }
            None => {
                return Err(Error::StartupFailure(format!(
                    "transaction log {} is corrupt before its final record",
                    log_path.display()
                )));
            }
        }
    }

    // Presence + completeness of every ADD file also proves the prepare
    // finished; the swap is then safe to finish even without COMMIT.
    let roll_forward = committed
        || (!adds.is_empty()
            && adds.iter().all(|(descriptor, size)| {
                Component::ALL
                    .iter()
                    .all(|c| descriptor.path(*c).exists())
                    && std::fs::metadata(descriptor.path(Component::Data))
                        .map(|m| m.len() == *size)
                        .unwrap_or(false)
            }));

    if roll_forward {
        for descriptor in &removes {
            delete_components(descriptor);
        }
        std::fs::remove_file(log_path).map_err(write_err)?;
        tracing::info!(log = %log_path.display(), "rolled transaction forward");
        Ok(RecoveryAction::RolledForward)
    } else {
        for (descriptor, _) in &adds {
            delete_components(descriptor);
        }
        std::fs::remove_file(log_path).map_err(write_err)?;
        tracing::info!(log = %log_path.display(), "rolled transaction back");
        Ok(RecoveryAction::RolledBack)
    }
}
