//! Bloom filter consulted by point reads before the data component is
//! touched.

use crc::{Crc, CRC_64_ECMA_182};
use serde::{Deserialize, Serialize};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const BITS_PER_KEY: usize = 10;
const HASH_COUNT: u32 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    nbits: u64,
    hashes: u32,
}

impl BloomFilter {
    pub fn new(expected_keys: usize) -> Self {
        let nbits = (expected_keys.max(1) * BITS_PER_KEY) as u64;
        let words = nbits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            nbits: words as u64 * 64,
            hashes: HASH_COUNT,
        }
    }

    /// Double hashing: two CRC-derived hashes generate the probe sequence.
    fn probes(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let h1 = CRC64.checksum(key);
        let h2 = h1.rotate_left(31) | 1;
        let nbits = self.nbits;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % nbits)
    }

    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<u64> = self.probes(key).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// False positives possible, false negatives not.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.probes(key)
            .collect::<Vec<_>>()
            .into_iter()
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }
}
