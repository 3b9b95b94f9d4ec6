use std::cmp::Ordering;
use std::fmt;

use crc::{Crc, CRC_64_ECMA_182};
use serde::{Deserialize, Serialize};

/// A partitioner-derived position on the token ring. Totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

impl Token {
    pub const MIN: Token = Token(i64::MIN);
    pub const MAX: Token = Token(i64::MAX);
}

/// Maps raw partition keys onto the ring, and optionally splits token
/// ranges for sharded flushes.
pub trait Partitioner: Send + Sync {
    fn token(&self, key: &[u8]) -> Token;

    /// Splits the full local token range into `parts` weighted-equal
    /// sub-ranges, returning the `parts - 1` interior boundaries. `None`
    /// when the partitioner cannot split ranges.
    fn split_evenly(&self, parts: usize) -> Option<Vec<Token>>;
}

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Default partitioner: CRC-64 of the raw key, mapped into i64 space.
/// Uniform enough that even token splits are weight-equal splits.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPartitioner;

impl Partitioner for HashPartitioner {
    fn token(&self, key: &[u8]) -> Token {
        Token(CRC64.checksum(key) as i64)
    }

    fn split_evenly(&self, parts: usize) -> Option<Vec<Token>> {
        if parts < 2 {
            return Some(Vec::new());
        }
        let width = u64::MAX / parts as u64;
        let boundaries = (1..parts as u64)
            .map(|i| Token(i64::MIN.wrapping_add((width * i) as i64)))
            .collect();
        Some(boundaries)
    }
}

/// A decorated partition key: the raw bytes plus their ring token. Compares
/// by token first, then by raw bytes, which is the order sorted files and
/// the memtable keep partitions in.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    token: Token,
    key: Vec<u8>,
}

impl PartitionKey {
    pub fn new(partitioner: &dyn Partitioner, key: Vec<u8>) -> Self {
        let token = partitioner.token(&key);
        Self { token, key }
    }

    /// Reassembles a key whose token was read back from disk.
    pub fn from_parts(token: Token, key: Vec<u8>) -> Self {
        Self { token, key }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn serialized_size(&self) -> usize {
        self.key.len() + std::mem::size_of::<Token>()
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PartitionKey(token={}, key={:02x?})",
            self.token.0, self.key
        )
    }
}

impl PartialOrd for PartitionKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartitionKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}
