//! The "flat" sorted-file format.
//!
//! One of the concrete formats living behind the sorted-file contract. The
//! data component is a sequence of length-prefixed, checksummed partition
//! records in partition-key order; the index component maps every partition
//! key to its record offset; filter and statistics components carry the
//! bloom filter and the sealed [`StatsMetadata`].
//!
//! ## Record framing
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | payload          |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! All integers are big-endian; the CRC-32/ISCSI checksum covers the
//! payload only. The same framing wraps the index, filter, and statistics
//! blobs in their own files.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::descriptor::{Component, Descriptor};
use super::filter::BloomFilter;
use super::metadata::StatsMetadata;
use crate::error::{write_err, Error, Result};
use crate::partition::key::PartitionKey;
use crate::partition::update::{PartitionUpdate, Timestamp};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn write_record<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer
        .write_u32::<BigEndian>(payload.len() as u32)
        .map_err(write_err)?;
    writer.write_all(payload).map_err(write_err)?;
    writer
        .write_u32::<BigEndian>(CRC32.checksum(payload))
        .map_err(write_err)?;
    Ok(())
}

/// Reads one framed record. `None` on clean EOF; `verify` controls whether
/// the checksum is recomputed.
fn read_record<R: Read>(reader: &mut R, verify: bool) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let stored = reader.read_u32::<BigEndian>()?;
    if verify && CRC32.checksum(&payload) != stored {
        return Err(Error::Corrupt("record checksum mismatch".to_string()));
    }
    Ok(Some(payload))
}

fn write_component_blob(descriptor: &Descriptor, component: Component, payload: &[u8]) -> Result<()> {
    let file = File::create(descriptor.path(component)).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    write_record(&mut writer, payload)?;
    writer.flush().map_err(write_err)?;
    writer.get_ref().sync_all().map_err(write_err)?;
    Ok(())
}

fn read_component_blob(descriptor: &Descriptor, component: Component) -> Result<Vec<u8>> {
    let file = File::open(descriptor.path(component))?;
    let mut reader = BufReader::new(file);
    read_record(&mut reader, true)?.ok_or_else(|| {
        Error::Corrupt(format!(
            "empty component {:?} for generation {}",
            component, descriptor.generation
        ))
    })
}

/// Streams partitions into a new flat sorted file. Partitions must arrive
/// in ascending key order; `finish` seals every component and fsyncs.
pub struct FlatWriter {
    descriptor: Descriptor,
    data: BufWriter<File>,
    offset: u64,
    index: Vec<(PartitionKey, u64)>,
    bloom: BloomFilter,
    first_key: Option<PartitionKey>,
    last_key: Option<PartitionKey>,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    min_local_deletion_time: u32,
    entry_count: u64,
}

impl FlatWriter {
    pub fn create(descriptor: Descriptor, expected_keys: usize) -> Result<Self> {
        std::fs::create_dir_all(&descriptor.dir).map_err(write_err)?;
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(descriptor.path(Component::Data))
            .map_err(write_err)?;
        Ok(Self {
            descriptor,
            data: BufWriter::new(file),
            offset: 0,
            index: Vec::new(),
            bloom: BloomFilter::new(expected_keys),
            first_key: None,
            last_key: None,
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
            min_local_deletion_time: u32::MAX,
            entry_count: 0,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn append(&mut self, update: &PartitionUpdate) -> Result<()> {
        if let Some(last) = &self.last_key {
            if update.key() <= last {
                return Err(Error::InvalidRequest(format!(
                    "partitions out of order: {:?} after {:?}",
                    update.key(),
                    last
                )));
            }
        }

        let payload = bincode::serialize(update)?;
        self.index.push((update.key().clone(), self.offset));
        self.bloom.insert(update.key().key());
        write_record(&mut self.data, &payload)?;
        self.offset += 8 + payload.len() as u64;

        let (min_ts, max_ts) = update.timestamp_bounds();
        self.min_timestamp = self.min_timestamp.min(min_ts);
        self.max_timestamp = self.max_timestamp.max(max_ts);
        self.min_local_deletion_time = self
            .min_local_deletion_time
            .min(update.min_local_deletion_time());
        if self.first_key.is_none() {
            self.first_key = Some(update.key().clone());
        }
        self.last_key = Some(update.key().clone());
        self.entry_count += 1;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Seals the file: fsyncs data, writes index/filter/statistics/TOC.
    /// Empty writers cannot be sealed; the flush pipeline skips shards with
    /// nothing in range instead.
    pub fn finish(mut self, repaired_at: i64, pending_repair: Option<u64>) -> Result<StatsMetadata> {
        let (Some(first_key), Some(last_key)) = (self.first_key.take(), self.last_key.take())
        else {
            return Err(Error::InvalidRequest(
                "refusing to seal an empty sorted file".to_string(),
            ));
        };

        self.data.flush().map_err(write_err)?;
        self.data.get_ref().sync_all().map_err(write_err)?;

        let stats = StatsMetadata {
            first_key,
            last_key,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            min_local_deletion_time: self.min_local_deletion_time,
            max_data_age: wall_clock_millis(),
            repaired_at,
            pending_repair,
            entry_count: self.entry_count,
            data_size: self.offset,
        };

        write_component_blob(
            &self.descriptor,
            Component::Index,
            &bincode::serialize(&self.index)?,
        )?;
        write_component_blob(
            &self.descriptor,
            Component::Filter,
            &bincode::serialize(&self.bloom)?,
        )?;
        write_component_blob(
            &self.descriptor,
            Component::Statistics,
            &bincode::serialize(&stats)?,
        )?;

        let toc: String = Component::ALL
            .iter()
            .map(|c| format!("{}\n", c.file_part()))
            .collect();
        std::fs::write(self.descriptor.path(Component::Toc), toc).map_err(write_err)?;

        Ok(stats)
    }
}

pub fn wall_clock_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Reader half of the flat format. The index, filter, and statistics
/// components are memory-resident; data records are fetched on demand.
pub struct FlatReader {
    descriptor: Descriptor,
    stats: StatsMetadata,
    index: Vec<(PartitionKey, u64)>,
    bloom: BloomFilter,
    crc_check_chance: f64,
}

impl FlatReader {
    pub fn open(descriptor: Descriptor, crc_check_chance: f64) -> Result<Self> {
        let index: Vec<(PartitionKey, u64)> =
            bincode::deserialize(&read_component_blob(&descriptor, Component::Index)?)?;
        let bloom: BloomFilter =
            bincode::deserialize(&read_component_blob(&descriptor, Component::Filter)?)?;
        let stats: StatsMetadata =
            bincode::deserialize(&read_component_blob(&descriptor, Component::Statistics)?)?;
        Ok(Self {
            descriptor,
            stats,
            index,
            bloom,
            crc_check_chance,
        })
    }

    pub fn stats(&self) -> &StatsMetadata {
        &self.stats
    }

    fn should_verify(&self) -> bool {
        self.crc_check_chance >= 1.0
            || (self.crc_check_chance > 0.0 && rand::random::<f64>() < self.crc_check_chance)
    }

    pub fn get(&self, key: &PartitionKey) -> Result<Option<PartitionUpdate>> {
        if !self.bloom.may_contain(key.key()) {
            return Ok(None);
        }
        let Ok(slot) = self.index.binary_search_by(|(k, _)| k.cmp(key)) else {
            return Ok(None);
        };
        let offset = self.index[slot].1;

        let file = File::open(self.descriptor.path(Component::Data))?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(offset))?;
        let payload = read_record(&mut reader, self.should_verify())?.ok_or_else(|| {
            Error::Corrupt(format!(
                "data component truncated at offset {offset} (generation {})",
                self.descriptor.generation
            ))
        })?;
        let update: PartitionUpdate = bincode::deserialize(&payload)?;
        if update.key() != key {
            return Err(Error::Corrupt(format!(
                "index points at wrong partition: wanted {:?}, found {:?}",
                key,
                update.key()
            )));
        }
        Ok(Some(update))
    }

    /// Sequential scan over partitions intersecting `range`. The scanner
    /// owns its own file handle, so concurrent scans never interfere.
    pub fn scan(
        &self,
        range: (std::ops::Bound<PartitionKey>, std::ops::Bound<PartitionKey>),
    ) -> Result<FlatScanner> {
        use std::ops::Bound;
        let start_slot = match &range.0 {
            Bound::Unbounded => 0,
            Bound::Included(k) => self
                .index
                .partition_point(|(key, _)| key < k),
            Bound::Excluded(k) => self
                .index
                .partition_point(|(key, _)| key <= k),
        };

        let mut reader = BufReader::new(File::open(self.descriptor.path(Component::Data))?);
        if let Some((_, offset)) = self.index.get(start_slot) {
            reader.seek(SeekFrom::Start(*offset))?;
        } else {
            reader.seek(SeekFrom::End(0))?;
        }

        Ok(FlatScanner {
            reader,
            upper: range.1,
            verify: self.should_verify(),
            done: false,
        })
    }
}

pub struct FlatScanner {
    reader: BufReader<File>,
    upper: std::ops::Bound<PartitionKey>,
    verify: bool,
    done: bool,
}

impl Iterator for FlatScanner {
    type Item = Result<PartitionUpdate>;

    fn next(&mut self) -> Option<Self::Item> {
        use std::ops::Bound;
        if self.done {
            return None;
        }
        let payload = match read_record(&mut self.reader, self.verify) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let update: PartitionUpdate = match bincode::deserialize(&payload) {
            Ok(update) => update,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };
        let in_range = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(k) => update.key() <= k,
            Bound::Excluded(k) => update.key() < k,
        };
        if !in_range {
            self.done = true;
            return None;
        }
        Some(Ok(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::clustering::Clustering;
    use crate::partition::key::{HashPartitioner, PartitionKey};
    use crate::partition::update::{Cell, Row};
    use crate::schema::TableId;
    use crate::sstable::descriptor::SsTableFormat;
    use crate::sstable::metadata::UNREPAIRED;
    use crate::testdir::TempDir;
    use std::ops::Bound;

    fn update(raw_key: &[u8], ts: i64) -> PartitionUpdate {
        let key = PartitionKey::new(&HashPartitioner, raw_key.to_vec());
        let mut u = PartitionUpdate::new(TableId(1), key);
        u.add_row(Row::new(Clustering::row(vec![b"c".to_vec()])).cell(0, Cell::live(ts, raw_key.to_vec())));
        u
    }

    fn write_file(dir: &TempDir, generation: u64, keys: &[&[u8]]) -> (Descriptor, StatsMetadata) {
        let descriptor = Descriptor::new(dir.path(), SsTableFormat::Flat, generation);
        let mut updates: Vec<_> = keys.iter().map(|k| update(k, 7)).collect();
        updates.sort_by(|a, b| a.key().cmp(b.key()));

        let mut writer = FlatWriter::create(descriptor.clone(), updates.len()).unwrap();
        for u in &updates {
            writer.append(u).unwrap();
        }
        let stats = writer.finish(UNREPAIRED, None).unwrap();
        (descriptor, stats)
    }

    #[test]
    fn test_write_then_point_read() {
        let dir = TempDir::new().unwrap();
        let (descriptor, stats) = write_file(&dir, 1, &[b"a", b"b", b"c"]);
        assert_eq!(stats.entry_count, 3);

        let reader = FlatReader::open(descriptor, 1.0).unwrap();
        let key = PartitionKey::new(&HashPartitioner, b"b".to_vec());
        let found = reader.get(&key).unwrap().unwrap();
        assert_eq!(found.key(), &key);

        let missing = PartitionKey::new(&HashPartitioner, b"zz".to_vec());
        assert!(reader.get(&missing).unwrap().is_none());
    }

    #[test]
    fn test_scan_full_and_bounded() {
        let dir = TempDir::new().unwrap();
        let keys: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i]).collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let (descriptor, _) = write_file(&dir, 1, &refs);

        let reader = FlatReader::open(descriptor, 1.0).unwrap();
        let all: Vec<_> = reader
            .scan((Bound::Unbounded, Bound::Unbounded))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(all.len(), 50);
        for pair in all.windows(2) {
            assert!(pair[0].key() < pair[1].key());
        }

        let mid = all[24].key().clone();
        let tail: Vec<_> = reader
            .scan((Bound::Excluded(mid.clone()), Bound::Unbounded))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(tail.len(), 25);
        assert!(tail.iter().all(|u| u.key() > &mid));
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let dir = TempDir::new().unwrap();
        let descriptor = Descriptor::new(dir.path(), SsTableFormat::Flat, 1);
        let mut updates = [update(b"x", 1), update(b"y", 1)];
        updates.sort_by(|a, b| a.key().cmp(b.key()));

        let mut writer = FlatWriter::create(descriptor, 2).unwrap();
        writer.append(&updates[1]).unwrap();
        assert!(matches!(
            writer.append(&updates[0]),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_empty_writer_refuses_seal() {
        let dir = TempDir::new().unwrap();
        let descriptor = Descriptor::new(dir.path(), SsTableFormat::Flat, 1);
        let writer = FlatWriter::create(descriptor, 0).unwrap();
        assert!(matches!(
            writer.finish(UNREPAIRED, None),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let (descriptor, _) = write_file(&dir, 1, &[b"a", b"b"]);

        // Flip bytes in the middle of the data component.
        let path = descriptor.path(Component::Data);
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        bytes[mid + 1] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let reader = FlatReader::open(descriptor, 1.0).unwrap();
        let results: Vec<_> = reader
            .scan((Bound::Unbounded, Bound::Unbounded))
            .unwrap()
            .collect();
        assert!(
            results.iter().any(|r| r.is_err()),
            "corruption must surface from the scanner"
        );
    }

    #[test]
    fn test_stats_cover_contents() {
        let dir = TempDir::new().unwrap();
        let (_, stats) = write_file(&dir, 1, &[b"a", b"b", b"c"]);
        assert_eq!(stats.min_timestamp, 7);
        assert_eq!(stats.max_timestamp, 7);
        assert_eq!(stats.min_local_deletion_time, u32::MAX);
        assert!(stats.first_key <= stats.last_key);
        assert!(stats.max_data_age > 0);
    }
}
