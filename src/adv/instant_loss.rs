//! The forced-loss advertisement ("instant on lost").
//!
//! When an advertiser shuts down it can broadcast, under the copresence
//! service UUID, the 4-byte hashes of the advertisements it is withdrawing so
//! that scanners report the loss immediately instead of waiting out the sweep
//! grace period.
//!
//! ```text
//! [version:3 | reserved:1 | count:4] [advertisement hash: 4] * count
//! ```
//!
//! The version field is disjoint from the advertisement header's, so the two
//! frame kinds sharing the copresence service data can never be confused.

use bytes::Bytes;

use crate::bytes::{ByteReader, ByteWriter};
use crate::hashing::ADVERTISEMENT_HASH_LENGTH;
use crate::utils::HexSlice;
use crate::Error;

const VERSION: u8 = 3;

/// Most hashes one frame can carry while staying inside a service-data
/// payload.
pub const MAX_HASHES: usize = 7;

/// A decoded forced-loss advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstantLossAdvertisement {
    hashes: Vec<Bytes>,
}

impl InstantLossAdvertisement {
    /// Creates a forced-loss advertisement from 4-byte advertisement hashes.
    pub fn from_hashes(hashes: Vec<Bytes>) -> Result<Self, Error> {
        if hashes.is_empty() || hashes.len() > MAX_HASHES {
            return Err(Error::FieldOutOfRange);
        }
        if hashes.iter().any(|h| h.len() != ADVERTISEMENT_HASH_LENGTH) {
            return Err(Error::LengthMismatch);
        }
        Ok(Self { hashes })
    }

    /// The advertisement hashes to declare lost.
    pub fn hashes(&self) -> &[Bytes] {
        &self.hashes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);

        let version = reader.read_bits(3)?;
        if version != VERSION {
            trace!("not a forced-loss frame: {:?}", HexSlice(bytes));
            return Err(Error::UnsupportedVersion);
        }
        let _reserved = reader.read_bits(1)?;
        let count = usize::from(reader.read_bits(4)?);
        if count == 0 || count > MAX_HASHES {
            return Err(Error::FieldOutOfRange);
        }
        if reader.bytes_left() != count * ADVERTISEMENT_HASH_LENGTH {
            return Err(Error::LengthMismatch);
        }

        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            hashes.push(reader.read_bytes(ADVERTISEMENT_HASH_LENGTH)?);
        }
        Ok(Self { hashes })
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut writer = ByteWriter::new();
        writer.write_bits(VERSION, 3)?;
        writer.write_bits(0, 1)?;
        writer.write_bits(self.hashes.len() as u8, 4)?;
        for hash in &self.hashes {
            writer.write_slice(hash)?;
        }
        writer.into_bytes()
    }
}
