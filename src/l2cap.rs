//! The L2CAP control packet used to request and serve advertisements over an
//! L2CAP socket before a data connection is established.
//!
//! A packet is either a bare command byte or a command with a length-prefixed
//! payload:
//!
//! ```text
//! [command]
//! [command] [length:2] [payload]
//! ```
//!
//! Only `RequestAdvertisement` (payload: a service-id hash) and
//! `ResponseAdvertisement` (payload: a serialized advertisement) carry data.
//!
//! Two decoders share one state machine: [`L2capPacket::from_bytes`] for an
//! in-memory buffer and [`L2capPacket::from_stream`] for a blocking input
//! stream, which reads exactly the bytes the packet occupies.

use std::io;

use bytes::Bytes;

use crate::adv::legacy::{MAX_ADVERTISEMENT_LENGTH, MIN_ADVERTISEMENT_LENGTH};
use crate::bytes::{ByteReader, ByteWriter};
use crate::hashing::{service_id_hash, SERVICE_ID_HASH_LENGTH};
use crate::utils::HexSlice;
use crate::Error;

/// Largest possible packet: command, length and a maximum-size advertisement.
pub const MAX_PACKET_LENGTH: usize = 1 + 2 + MAX_ADVERTISEMENT_LENGTH;

enum_with_unknown! {
    /// L2CAP control commands. Values 4..=20 are reserved.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Command(u8) {
        /// Ask the server for the advertisement registered under a service-id
        /// hash.
        RequestAdvertisement = 1,
        /// Tell the server all advertisements have been fetched.
        RequestAdvertisementFinish = 2,
        /// Repurpose the socket for a data connection.
        RequestDataConnection = 3,
        /// Serve a requested advertisement.
        ResponseAdvertisement = 21,
        /// The requested service id is not registered on the server.
        ResponseServiceIdNotFound = 22,
        /// The data connection may proceed.
        ResponseDataConnectionReady = 23,
        /// The data connection cannot be established.
        ResponseDataConnectionFailure = 24,
    }
}

/// A decoded L2CAP control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L2capPacket {
    RequestAdvertisement { service_id_hash: Bytes },
    RequestAdvertisementFinish,
    RequestDataConnection,
    ResponseAdvertisement { advertisement: Bytes },
    ResponseServiceIdNotFound,
    ResponseDataConnectionReady,
    ResponseDataConnectionFailure,
}

/// Byte source abstraction letting the buffer and stream decoders share the
/// parsing state machine.
trait PacketSource {
    fn read_chunk(&mut self, len: usize) -> Result<Bytes, Error>;
}

impl PacketSource for ByteReader<'_> {
    fn read_chunk(&mut self, len: usize) -> Result<Bytes, Error> {
        self.read_bytes(len)
    }
}

struct BlockingSource<'a, R: io::Read>(&'a mut R);

impl<'a, R: io::Read> PacketSource for BlockingSource<'a, R> {
    fn read_chunk(&mut self, len: usize) -> Result<Bytes, Error> {
        let mut buf = vec![0; len];
        self.0.read_exact(&mut buf).map_err(|_| Error::InputTooShort)?;
        Ok(buf.into())
    }
}

impl L2capPacket {
    pub fn command(&self) -> Command {
        match self {
            L2capPacket::RequestAdvertisement { .. } => Command::RequestAdvertisement,
            L2capPacket::RequestAdvertisementFinish => Command::RequestAdvertisementFinish,
            L2capPacket::RequestDataConnection => Command::RequestDataConnection,
            L2capPacket::ResponseAdvertisement { .. } => Command::ResponseAdvertisement,
            L2capPacket::ResponseServiceIdNotFound => Command::ResponseServiceIdNotFound,
            L2capPacket::ResponseDataConnectionReady => Command::ResponseDataConnectionReady,
            L2capPacket::ResponseDataConnectionFailure => Command::ResponseDataConnectionFailure,
        }
    }

    /// Decodes a packet that must span the entire buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);
        let packet = Self::decode(&mut reader)?;
        if !reader.is_empty() {
            debug!("trailing bytes after L2CAP packet: {:?}", HexSlice(bytes));
            return Err(Error::LengthMismatch);
        }
        Ok(packet)
    }

    /// Decodes a packet from a blocking input stream, consuming exactly the
    /// packet's bytes.
    pub fn from_stream<R: io::Read>(stream: &mut R) -> Result<Self, Error> {
        Self::decode(&mut BlockingSource(stream))
    }

    fn decode(source: &mut impl PacketSource) -> Result<Self, Error> {
        let command = Command::from(source.read_chunk(1)?[0]);

        match command {
            Command::RequestAdvertisementFinish => return Ok(L2capPacket::RequestAdvertisementFinish),
            Command::RequestDataConnection => return Ok(L2capPacket::RequestDataConnection),
            Command::ResponseServiceIdNotFound => return Ok(L2capPacket::ResponseServiceIdNotFound),
            Command::ResponseDataConnectionReady => {
                return Ok(L2capPacket::ResponseDataConnectionReady)
            }
            Command::ResponseDataConnectionFailure => {
                return Ok(L2capPacket::ResponseDataConnectionFailure)
            }
            Command::RequestAdvertisement | Command::ResponseAdvertisement => {}
            Command::Unknown(raw) => {
                warn!("unknown L2CAP command byte {:#04x}", raw);
                return Err(Error::UnknownCommand);
            }
        }

        let length_bytes = source.read_chunk(2)?;
        let length = usize::from(length_bytes[0]) << 8 | usize::from(length_bytes[1]);
        if length == 0 {
            return Err(Error::LengthMismatch);
        }

        match command {
            Command::RequestAdvertisement => {
                if length < SERVICE_ID_HASH_LENGTH {
                    return Err(Error::FieldOutOfRange);
                }
                let service_id_hash = source.read_chunk(length)?;
                Ok(L2capPacket::RequestAdvertisement { service_id_hash })
            }
            Command::ResponseAdvertisement => {
                if length > MAX_ADVERTISEMENT_LENGTH {
                    return Err(Error::FieldOutOfRange);
                }
                let advertisement = source.read_chunk(length)?;
                Ok(L2capPacket::ResponseAdvertisement { advertisement })
            }
            _ => unreachable!("commands without payloads returned above"),
        }
    }

    /// Encodes the packet.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut writer = ByteWriter::new();
        writer.write_u8(u8::from(self.command()))?;
        match self {
            L2capPacket::RequestAdvertisement { service_id_hash } => {
                writer.write_u16(service_id_hash.len() as u16)?;
                writer.write_slice(service_id_hash)?;
            }
            L2capPacket::ResponseAdvertisement { advertisement } => {
                writer.write_u16(advertisement.len() as u16)?;
                writer.write_slice(advertisement)?;
            }
            _ => {}
        }
        writer.into_bytes()
    }

    /// Builds a `RequestAdvertisement` packet for a service id.
    pub fn request_advertisement(service_id: &str) -> Result<Bytes, Error> {
        if service_id.is_empty() {
            return Err(Error::FieldOutOfRange);
        }
        L2capPacket::RequestAdvertisement {
            service_id_hash: service_id_hash(service_id),
        }
        .to_bytes()
    }

    /// Builds a `ResponseAdvertisement` packet carrying a serialized
    /// advertisement.
    pub fn response_advertisement(advertisement: Bytes) -> Result<Bytes, Error> {
        if advertisement.len() < MIN_ADVERTISEMENT_LENGTH
            || advertisement.len() > MAX_ADVERTISEMENT_LENGTH
        {
            return Err(Error::FieldOutOfRange);
        }
        L2capPacket::ResponseAdvertisement { advertisement }.to_bytes()
    }
}
