//! The advertisement header broadcast in copresence service data.
//!
//! The header is the scanner-visible descriptor of a remote advertiser:
//!
//! ```text
//! [version:3 | extended:1 | num_slots:4] [bloom filter: 10] [advertisement hash: 4] ([psm: 2])
//! ```
//!
//! The bloom filter gates GATT reads (see [`BloomFilter`]) and the
//! advertisement hash is the advertiser's identity across sightings, which is
//! why equality and hashing cover every field. Only version 2 headers are
//! acted upon; other versions parse but are rejected by the tracker.

use bytes::Bytes;

use crate::adv::bloom::{BloomFilter, BLOOM_FILTER_LENGTH};
use crate::bytes::{ByteReader, ByteWriter};
use crate::hashing::ADVERTISEMENT_HASH_LENGTH;
use crate::utils::HexSlice;
use crate::Error;

/// Header length without the optional PSM.
pub const MIN_ADVERTISEMENT_HEADER_LENGTH: usize =
    1 + BLOOM_FILTER_LENGTH + ADVERTISEMENT_HASH_LENGTH;

/// Largest value of the 4-bit slot count.
pub const MAX_SLOTS: u8 = 15;

enum_with_unknown! {
    /// Advertisement header versions.
    ///
    /// Only [`Version::V2`] is in active use: V1 predates headers that gate a
    /// GATT characteristic and the two schemes are not compatible.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum Version(u8) {
        V1 = 1,
        V2 = 2,
    }
}

/// A decoded advertisement header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdvertisementHeader {
    version: Version,
    supports_extended_advertisement: bool,
    num_slots: u8,
    service_id_bloom_filter: Bytes,
    advertisement_hash: Bytes,
    psm: Option<u16>,
}

impl AdvertisementHeader {
    /// Creates a header, validating the field ranges.
    pub fn new(
        version: Version,
        supports_extended_advertisement: bool,
        num_slots: u8,
        service_id_bloom_filter: &BloomFilter,
        advertisement_hash: Bytes,
        psm: Option<u16>,
    ) -> Result<Self, Error> {
        if num_slots > MAX_SLOTS {
            return Err(Error::FieldOutOfRange);
        }
        if advertisement_hash.len() != ADVERTISEMENT_HASH_LENGTH {
            return Err(Error::LengthMismatch);
        }
        Ok(Self {
            version,
            supports_extended_advertisement,
            num_slots,
            service_id_bloom_filter: service_id_bloom_filter.to_bytes(),
            advertisement_hash,
            psm,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether the advertiser also delivers its advertisement over extended
    /// advertising, making a GATT read potentially redundant.
    pub fn supports_extended_advertisement(&self) -> bool {
        self.supports_extended_advertisement
    }

    /// Number of GATT characteristic slots the advertiser serves.
    pub fn num_slots(&self) -> u8 {
        self.num_slots
    }

    pub fn service_id_bloom_filter(&self) -> BloomFilter {
        // The stored bytes are always exactly BLOOM_FILTER_LENGTH long.
        BloomFilter::from_bytes(&self.service_id_bloom_filter)
            .unwrap_or_else(BloomFilter::new)
    }

    pub fn advertisement_hash(&self) -> &Bytes {
        &self.advertisement_hash
    }

    pub fn psm(&self) -> Option<u16> {
        self.psm
    }

    /// Whether upper layers should act on this header.
    pub fn is_valid(&self) -> bool {
        self.version == Version::V2
    }

    /// Decodes a header from its on-wire form.
    ///
    /// Unknown versions decode successfully (the version gate lives in
    /// [`AdvertisementHeader::is_valid`]), but any length other than 15 or 17
    /// bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);

        let version = Version::from(reader.read_bits(3)?);
        let supports_extended_advertisement = reader.read_bits(1)? != 0;
        let num_slots = reader.read_bits(4)?;
        let service_id_bloom_filter = reader.read_bytes(BLOOM_FILTER_LENGTH)?;
        let advertisement_hash = reader.read_bytes(ADVERTISEMENT_HASH_LENGTH)?;

        let psm = match reader.bytes_left() {
            0 => None,
            2 => Some(reader.read_u16()?),
            _ => {
                debug!(
                    "advertisement header with stray trailing bytes: {:?}",
                    HexSlice(bytes)
                );
                return Err(Error::LengthMismatch);
            }
        };

        Ok(Self {
            version,
            supports_extended_advertisement,
            num_slots,
            service_id_bloom_filter,
            advertisement_hash,
            psm,
        })
    }

    /// Encodes the header; 15 bytes, or 17 when a PSM is carried.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut writer = ByteWriter::new();
        writer.write_bits(u8::from(self.version), 3)?;
        writer.write_bits(self.supports_extended_advertisement as u8, 1)?;
        writer.write_bits(self.num_slots, 4)?;
        writer.write_slice(&self.service_id_bloom_filter)?;
        writer.write_slice(&self.advertisement_hash)?;
        if let Some(psm) = self.psm {
            writer.write_u16(psm)?;
        }
        writer.into_bytes()
    }
}
