//! Utilities for decoding from and encoding into bytes.
//!
//! This module defines the helper structs [`ByteReader`] and [`ByteWriter`],
//! which wrap a `&[u8]` (or a growable output buffer) and offer utilities to
//! read and write sub-byte bit fields, fixed-width integers and byte runs.
//!
//! All multi-byte integers are in **network (big-endian) order**, which is
//! what every frame format in this crate uses on the wire.
//!
//! Bit fields are packed MSB-first within a byte and may not straddle a byte
//! boundary; byte-granularity accesses require the bit accumulator to be
//! empty. A failed read leaves the reader exactly where it was, so parsers
//! can fail closed without leaking partial state.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::Error;

/// Allows reading values from a borrowed byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    /// Bits of the current partially-consumed byte, left-aligned in their
    /// original positions.
    bits_buffer: u8,
    /// Number of not-yet-consumed bits in `bits_buffer`.
    bits_unused: u8,
}

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader` that will read from the given byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader {
            buf: bytes,
            bits_buffer: 0,
            bits_unused: 0,
        }
    }

    /// Returns the number of whole bytes that can still be read from `self`.
    pub fn bytes_left(&self) -> usize {
        self.buf.len()
    }

    /// Returns whether `self` is fully consumed (no whole bytes and no
    /// buffered bits remain).
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.bits_unused == 0
    }

    /// Returns whether at least `n` whole bytes can still be read.
    pub fn is_available(&self, n: usize) -> bool {
        self.bytes_left() >= n
    }

    /// Reads a bit field of `width` bits (`1..=8`), MSB-first.
    ///
    /// When the accumulator is empty, the next byte is consumed to refill it.
    /// A field that would cross into the following byte fails with
    /// [`Error::UnalignedBitAccess`] and consumes nothing.
    pub fn read_bits(&mut self, width: u8) -> Result<u8, Error> {
        if width == 0 || width > 8 {
            return Err(Error::FieldOutOfRange);
        }
        if self.bits_unused == 0 {
            let (first, rest) = match self.buf.split_first() {
                Some(split) => split,
                None => return Err(Error::InputTooShort),
            };
            self.buf = rest;
            self.bits_buffer = *first;
            self.bits_unused = 8;
        }
        if self.bits_unused < width {
            return Err(Error::UnalignedBitAccess);
        }

        let mask = if width == 8 { 0xFF } else { (1 << width) - 1 };
        let value = (self.bits_buffer >> (self.bits_unused - width)) & mask;
        self.bits_unused -= width;
        Ok(value)
    }

    /// Reads a byte slice of length `len` without copying.
    ///
    /// Fails with [`Error::UnalignedBitAccess`] when bits are still buffered
    /// and with [`Error::InputTooShort`] when fewer than `len` bytes remain;
    /// in both cases `self` is not advanced.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bits_unused != 0 {
            return Err(Error::UnalignedBitAccess);
        }
        if self.bytes_left() < len {
            return Err(Error::InputTooShort);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Reads `len` bytes into an owned [`Bytes`].
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, Error> {
        Ok(Bytes::copy_from_slice(self.read_slice(len)?))
    }

    /// Reads the remaining whole bytes of the input.
    pub fn read_rest(&mut self) -> Result<Bytes, Error> {
        self.read_bytes(self.bytes_left())
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_slice(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, Error> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(BigEndian::read_u16(self.read_slice(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16, Error> {
        Ok(BigEndian::read_i16(self.read_slice(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(BigEndian::read_u32(self.read_slice(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(BigEndian::read_i32(self.read_slice(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(BigEndian::read_u64(self.read_slice(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64, Error> {
        Ok(BigEndian::read_i64(self.read_slice(8)?))
    }
}

/// Accumulates encoded data into a growable byte buffer.
pub struct ByteWriter {
    buf: BytesMut,
    bits_buffer: u8,
    /// Number of bits already placed into `bits_buffer`.
    bits_used: u8,
}

impl ByteWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        ByteWriter {
            buf: BytesMut::new(),
            bits_buffer: 0,
            bits_used: 0,
        }
    }

    /// Finishes the writer and returns the encoded bytes.
    ///
    /// Fails with [`Error::UnalignedBitAccess`] when a partially-filled byte
    /// is still buffered.
    pub fn into_bytes(self) -> Result<Bytes, Error> {
        if self.bits_used != 0 {
            return Err(Error::UnalignedBitAccess);
        }
        Ok(self.buf.freeze())
    }

    /// Number of whole bytes written so far.
    pub fn bytes_written(&self) -> usize {
        self.buf.len()
    }

    /// Writes the low `width` bits (`1..=8`) of `value`, MSB-first.
    ///
    /// The field may not cross a byte boundary; once the accumulator fills an
    /// entire byte it is flushed to the output.
    pub fn write_bits(&mut self, value: u8, width: u8) -> Result<(), Error> {
        if width == 0 || width > 8 {
            return Err(Error::FieldOutOfRange);
        }
        let mask = if width == 8 { 0xFF } else { (1 << width) - 1 };
        if value & !mask != 0 {
            return Err(Error::FieldOutOfRange);
        }
        if self.bits_used + width > 8 {
            return Err(Error::UnalignedBitAccess);
        }

        self.bits_buffer |= (value & mask) << (8 - self.bits_used - width);
        self.bits_used += width;
        if self.bits_used == 8 {
            self.buf.extend_from_slice(&[self.bits_buffer]);
            self.bits_buffer = 0;
            self.bits_used = 0;
        }
        Ok(())
    }

    /// Writes all bytes from `slice` to the output.
    ///
    /// Fails with [`Error::UnalignedBitAccess`] when bits are still buffered.
    pub fn write_slice(&mut self, slice: &[u8]) -> Result<(), Error> {
        if self.bits_used != 0 {
            return Err(Error::UnalignedBitAccess);
        }
        self.buf.extend_from_slice(slice);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), Error> {
        self.write_slice(&[value])
    }

    pub fn write_i8(&mut self, value: i8) -> Result<(), Error> {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), Error> {
        let mut raw = [0; 2];
        BigEndian::write_u16(&mut raw, value);
        self.write_slice(&raw)
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), Error> {
        let mut raw = [0; 2];
        BigEndian::write_i16(&mut raw, value);
        self.write_slice(&raw)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        let mut raw = [0; 4];
        BigEndian::write_u32(&mut raw, value);
        self.write_slice(&raw)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), Error> {
        let mut raw = [0; 4];
        BigEndian::write_i32(&mut raw, value);
        self.write_slice(&raw)
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), Error> {
        let mut raw = [0; 8];
        BigEndian::write_u64(&mut raw, value);
        self.write_slice(&raw)
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), Error> {
        let mut raw = [0; 8];
        BigEndian::write_i64(&mut raw, value);
        self.write_slice(&raw)
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_bits_msb_first() {
        let mut r = ByteReader::new(&[0b101_0_0110, 0xFF]);
        assert_eq!(r.read_bits(3), Ok(0b101));
        assert_eq!(r.read_bits(1), Ok(0));
        assert_eq!(r.read_bits(4), Ok(0b0110));
        assert_eq!(r.read_bits(8), Ok(0xFF));
        assert!(r.is_empty());
    }

    #[test]
    fn bits_may_not_straddle_bytes() {
        let mut r = ByteReader::new(&[0xAB, 0xCD]);
        assert_eq!(r.read_bits(1), Ok(1));
        assert_eq!(r.read_bits(9), Err(Error::FieldOutOfRange));
        assert_eq!(r.read_bits(8), Err(Error::UnalignedBitAccess));
        // The failed reads must not have consumed anything.
        assert_eq!(r.read_bits(7), Ok(0x2B));
        assert_eq!(r.read_u8(), Ok(0xCD));
    }

    #[test]
    fn nine_bits_from_byte_boundary_fails() {
        let mut r = ByteReader::new(&[0xAB, 0xCD]);
        assert_eq!(r.read_bits(9), Err(Error::FieldOutOfRange));
        assert_eq!(r.bytes_left(), 2);
    }

    #[test]
    fn byte_reads_require_alignment() {
        let mut r = ByteReader::new(&[0xAB, 0x12, 0x34]);
        assert_eq!(r.read_bits(1), Ok(1));
        assert_eq!(r.read_u16(), Err(Error::UnalignedBitAccess));
        assert_eq!(r.read_bits(7), Ok(0x2B));
        assert_eq!(r.read_u16(), Ok(0x1234));
    }

    #[test]
    fn network_order_integers() {
        let mut r = ByteReader::new(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(r.read_u32(), Ok(0x0102_0304));
        assert_eq!(r.read_u16(), Ok(0x0506));
        assert_eq!(r.read_i16(), Ok(0x0708));

        let mut w = ByteWriter::new();
        w.write_u32(0x0102_0304).unwrap();
        w.write_u16(0x0506).unwrap();
        assert_eq!(
            w.into_bytes().unwrap().as_ref(),
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]
        );
    }

    #[test]
    fn failed_reads_do_not_advance() {
        let mut r = ByteReader::new(&[0x01]);
        assert_eq!(r.read_u32(), Err(Error::InputTooShort));
        assert_eq!(r.read_u8(), Ok(0x01));
        assert_eq!(r.read_u8(), Err(Error::InputTooShort));
    }

    #[test]
    fn write_bits_round_trip() {
        let mut w = ByteWriter::new();
        w.write_bits(0b010, 3).unwrap();
        w.write_bits(1, 1).unwrap();
        w.write_bits(0b0011, 4).unwrap();
        w.write_u8(0x7F).unwrap();
        let bytes = w.into_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[0b010_1_0011, 0x7F]);

        let mut w = ByteWriter::new();
        assert_eq!(w.write_bits(0b100, 2), Err(Error::FieldOutOfRange));
        w.write_bits(0b1, 1).unwrap();
        assert_eq!(w.write_u8(0), Err(Error::UnalignedBitAccess));
        assert_eq!(w.write_bits(0, 8), Err(Error::UnalignedBitAccess));
        w.write_bits(0, 7).unwrap();
        assert_eq!(w.into_bytes().unwrap().as_ref(), &[0x80]);
    }

    #[test]
    fn unterminated_bit_run_fails_to_finish() {
        let mut w = ByteWriter::new();
        w.write_bits(0b11, 2).unwrap();
        assert_eq!(w.into_bytes().unwrap_err(), Error::UnalignedBitAccess);
    }
}
