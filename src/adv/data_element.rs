//! The TLV data element used by structured advertisements.
//!
//! A data element is a `(type, value)` pair with two header encodings. The
//! compact one-byte header fits types up to 15 and values up to 7 bytes:
//!
//! ```text
//! [0 | length:3 | type:4] [value...]
//! ```
//!
//! Everything else uses the two-byte header:
//!
//! ```text
//! [1 | length:7] [type:8] [value...]
//! ```
//!
//! Type 0 is reserved and values are capped at 127 bytes in either form.

use bytes::Bytes;

use crate::bytes::{ByteReader, ByteWriter};
use crate::utils::HexSlice;
use crate::Error;

/// Largest encodable value length.
pub const MAX_VALUE_LENGTH: usize = 127;

/// A single TLV unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataElement {
    de_type: u8,
    value: Bytes,
}

impl DataElement {
    /// Creates a data element, validating the type and length ranges.
    pub fn new(de_type: u8, value: Bytes) -> Result<Self, Error> {
        if de_type == 0 {
            warn!("reserved data element type 0");
            return Err(Error::FieldOutOfRange);
        }
        if value.len() > MAX_VALUE_LENGTH {
            warn!("data element value too long: {} bytes", value.len());
            return Err(Error::FieldOutOfRange);
        }
        Ok(Self { de_type, value })
    }

    pub fn de_type(&self) -> u8 {
        self.de_type
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Decodes one data element from `reader`, leaving the reader positioned
    /// after it.
    pub fn from_reader(reader: &mut ByteReader<'_>) -> Result<Self, Error> {
        let two_byte_header = reader.read_bits(1)? != 0;

        let (length, de_type) = if two_byte_header {
            let length = reader.read_bits(7)?;
            let de_type = reader.read_u8()?;
            (length, de_type)
        } else {
            let length = reader.read_bits(3)?;
            let de_type = reader.read_bits(4)?;
            (length, de_type)
        };
        if de_type == 0 {
            return Err(Error::FieldOutOfRange);
        }

        let value = reader.read_bytes(usize::from(length))?;
        Ok(Self { de_type, value })
    }

    /// Decodes a data element that must span the entire input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);
        let de = Self::from_reader(&mut reader)?;
        if !reader.is_empty() {
            debug!("trailing bytes after data element: {:?}", HexSlice(bytes));
            return Err(Error::LengthMismatch);
        }
        Ok(de)
    }

    /// Encodes this element into `writer`, choosing the shortest header form.
    pub fn to_writer(&self, writer: &mut ByteWriter) -> Result<(), Error> {
        let one_byte_header = self.de_type <= 15 && self.value.len() <= 7;
        if one_byte_header {
            writer.write_bits(0, 1)?;
            writer.write_bits(self.value.len() as u8, 3)?;
            writer.write_bits(self.de_type, 4)?;
        } else {
            writer.write_bits(1, 1)?;
            writer.write_bits(self.value.len() as u8, 7)?;
            writer.write_u8(self.de_type)?;
        }
        writer.write_slice(&self.value)
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut writer = ByteWriter::new();
        self.to_writer(&mut writer)?;
        writer.into_bytes()
    }
}
