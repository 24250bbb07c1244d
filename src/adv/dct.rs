//! The DCT advertisement, a compact self-contained format that carries a
//! truncated device name and an L2CAP PSM instead of gating a GATT read.
//!
//! The frame is a fixed sequence of three data elements behind a version
//! byte:
//!
//! ```text
//! [version << 5]
//! [DE type 5, len 2: service-id hash]     (HKDF-SHA256, not the plain scheme)
//! [DE type 4, len 2: PSM]
//! [DE type 7, two-byte form: [truncated:1 | dedup:7] [utf-8 name, <= 7 bytes]]
//! ```
//!
//! Any other element order, type or length is rejected. Device names longer
//! than 7 bytes are truncated on a UTF-8 character boundary and flagged.

use bytes::Bytes;

use crate::adv::data_element::DataElement;
use crate::bytes::{ByteReader, ByteWriter};
use crate::hashing::{dct_service_id_hash, sha256_prefix, DCT_SERVICE_ID_HASH_LENGTH};
use crate::utils::HexSlice;
use crate::Error;

const VERSION: u8 = 1;

/// Longest device name carried on the wire, in bytes.
pub const MAX_DEVICE_NAME_LENGTH: usize = 7;

/// Largest dedup value; the field is 7 bits wide.
pub const MAX_DEDUP: u8 = 0x7F;

const DE_TYPE_PSM: u8 = 0x04;
const DE_TYPE_SERVICE_ID_HASH: u8 = 0x05;
const DE_TYPE_DEVICE_INFORMATION: u8 = 0x07;

const ENDPOINT_ID_CHARS: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";

/// A decoded DCT advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DctAdvertisement {
    service_id_hash: Bytes,
    psm: u16,
    device_name: String,
    is_device_name_truncated: bool,
    dedup: u8,
}

impl DctAdvertisement {
    /// Creates an advertisement for `service_id`, truncating the device name
    /// to fit the wire format.
    pub fn new(
        service_id: &str,
        device_name: &str,
        psm: u16,
        dedup: u8,
    ) -> Result<Self, Error> {
        if service_id.is_empty() || device_name.is_empty() {
            return Err(Error::FieldOutOfRange);
        }
        if psm == 0 || dedup > MAX_DEDUP {
            return Err(Error::FieldOutOfRange);
        }

        let truncated_name = truncate_device_name(device_name, MAX_DEVICE_NAME_LENGTH);
        Ok(Self {
            service_id_hash: dct_service_id_hash(service_id),
            psm,
            device_name: truncated_name.to_owned(),
            is_device_name_truncated: truncated_name.len() != device_name.len(),
            dedup,
        })
    }

    /// The advertised 2-byte HKDF service-id hash.
    pub fn service_id_hash(&self) -> &Bytes {
        &self.service_id_hash
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_device_name_truncated(&self) -> bool {
        self.is_device_name_truncated
    }

    pub fn dedup(&self) -> u8 {
        self.dedup
    }

    /// Whether this advertisement was produced for `service_id`.
    pub fn matches_service_id(&self, service_id: &str) -> bool {
        self.service_id_hash == dct_service_id_hash(service_id)
    }

    /// Decodes a DCT advertisement, requiring the exact three-element layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);

        let header = reader.read_u8()?;
        if header != VERSION << 5 {
            debug!("unsupported DCT header {:#04x} in {:?}", header, HexSlice(bytes));
            return Err(Error::UnsupportedVersion);
        }

        let service_id_hash = DataElement::from_reader(&mut reader)?;
        if service_id_hash.de_type() != DE_TYPE_SERVICE_ID_HASH
            || service_id_hash.len() != DCT_SERVICE_ID_HASH_LENGTH
        {
            return Err(Error::FieldOutOfRange);
        }

        let psm = DataElement::from_reader(&mut reader)?;
        if psm.de_type() != DE_TYPE_PSM || psm.len() != 2 {
            return Err(Error::FieldOutOfRange);
        }
        let psm = u16::from(psm.value()[0]) << 8 | u16::from(psm.value()[1]);
        if psm == 0 {
            return Err(Error::FieldOutOfRange);
        }

        let device_information = DataElement::from_reader(&mut reader)?;
        if device_information.de_type() != DE_TYPE_DEVICE_INFORMATION
            || device_information.is_empty()
        {
            return Err(Error::FieldOutOfRange);
        }
        let info = device_information.value();
        let is_device_name_truncated = info[0] & 0x80 != 0;
        let dedup = info[0] & 0x7F;
        let device_name = core::str::from_utf8(&info[1..])
            .map_err(|_| Error::InvalidUtf8)?
            .to_owned();
        if device_name.len() > MAX_DEVICE_NAME_LENGTH {
            return Err(Error::FieldOutOfRange);
        }

        if !reader.is_empty() {
            return Err(Error::LengthMismatch);
        }

        Ok(Self {
            service_id_hash: service_id_hash.value().clone(),
            psm,
            device_name,
            is_device_name_truncated,
            dedup,
        })
    }

    /// Encodes the advertisement.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut writer = ByteWriter::new();
        writer.write_u8(VERSION << 5)?;

        writer.write_bits(self.service_id_hash.len() as u8, 4)?;
        writer.write_bits(DE_TYPE_SERVICE_ID_HASH, 4)?;
        writer.write_slice(&self.service_id_hash)?;

        writer.write_bits(2, 4)?;
        writer.write_bits(DE_TYPE_PSM, 4)?;
        writer.write_u16(self.psm)?;

        // Device information always uses the two-byte element header; the
        // flag-and-dedup byte precedes the name.
        writer.write_bits(1, 1)?;
        writer.write_bits(self.device_name.len() as u8 + 1, 7)?;
        writer.write_u8(DE_TYPE_DEVICE_INFORMATION)?;
        writer.write_bits(self.is_device_name_truncated as u8, 1)?;
        writer.write_bits(self.dedup, 7)?;
        writer.write_slice(self.device_name.as_bytes())?;

        writer.into_bytes()
    }
}

/// Derives the 4-character endpoint id shown to users:
/// `SHA-256(truncate7(name) || dedup)[..4]`, each byte reduced into the
/// endpoint-id alphabet.
pub fn generate_endpoint_id(dedup: u8, device_name: &str) -> Result<String, Error> {
    if device_name.is_empty() {
        return Err(Error::FieldOutOfRange);
    }
    if dedup > MAX_DEDUP {
        return Err(Error::FieldOutOfRange);
    }

    let mut input = truncate_device_name(device_name, MAX_DEVICE_NAME_LENGTH)
        .as_bytes()
        .to_vec();
    input.push(dedup);

    let hash = sha256_prefix(&input, 4);
    Ok(hash
        .iter()
        .map(|&b| ENDPOINT_ID_CHARS[usize::from(b) % ENDPOINT_ID_CHARS.len()] as char)
        .collect())
}

/// Returns the longest prefix of `name` that fits `max_bytes` without
/// splitting a UTF-8 character.
fn truncate_device_name(name: &str, max_bytes: usize) -> &str {
    let mut end = 0;
    for (index, ch) in name.char_indices() {
        if index + ch.len_utf8() > max_bytes {
            break;
        }
        end = index + ch.len_utf8();
    }
    &name[..end]
}
