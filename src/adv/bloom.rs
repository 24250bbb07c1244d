//! The 10-byte service-id bloom filter embedded in advertisement headers.
//!
//! Advertisers insert every service id they carry; scanners test the ids they
//! track against it to decide whether a header is worth an expensive GATT
//! read. False positives only cost a wasted read, false negatives cannot
//! happen, so the filter errs heavily on the small side.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Number of bytes the filter occupies inside an advertisement header.
pub const BLOOM_FILTER_LENGTH: usize = 10;

/// Number of hash positions derived per inserted element.
const HASH_COUNT: usize = 5;

/// A fixed-size bloom filter over service-id strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: [u8; BLOOM_FILTER_LENGTH],
}

impl BloomFilter {
    /// Creates an empty filter (all bits zero).
    pub fn new() -> Self {
        Self {
            bits: [0; BLOOM_FILTER_LENGTH],
        }
    }

    /// Reconstructs a filter from the 10 bytes carried in a header.
    ///
    /// Returns `None` when `bytes` has the wrong length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != BLOOM_FILTER_LENGTH {
            return None;
        }
        let mut bits = [0; BLOOM_FILTER_LENGTH];
        bits.copy_from_slice(bytes);
        Some(Self { bits })
    }

    /// Returns the filter's on-wire byte representation.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Inserts a service id.
    pub fn add(&mut self, service_id: &str) {
        for pos in Self::bit_positions(service_id) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Tests a service id for membership. May report false positives.
    pub fn possibly_contains(&self, service_id: &str) -> bool {
        Self::bit_positions(service_id)
            .iter()
            .all(|pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }

    /// Derives the bit positions for an element: the first five big-endian
    /// i32 words of its SHA-256 digest, reduced into the bit range.
    fn bit_positions(service_id: &str) -> [usize; HASH_COUNT] {
        let digest = Sha256::digest(service_id.as_bytes());
        let mut positions = [0; HASH_COUNT];
        for (i, pos) in positions.iter_mut().enumerate() {
            let word = BigEndian::read_i32(&digest[i * 4..i * 4 + 4]);
            *pos = word.rem_euclid((BLOOM_FILTER_LENGTH * 8) as i32) as usize;
        }
        positions
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}
