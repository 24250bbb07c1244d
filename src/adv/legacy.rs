//! The legacy BLE advertisement carried in GATT characteristics and, in its
//! fast form, directly in service data.
//!
//! Both forms share the flag byte:
//!
//! ```text
//! [version:3 | socket_version:3 | fast:1 | secondary:1]
//! ```
//!
//! The regular form then carries a 3-byte service-id hash and a 4-byte data
//! length; the fast form drops the hash and shrinks the length to one byte so
//! the whole frame fits in a BLE service-data payload:
//!
//! ```text
//! regular: [flags] [service_id_hash:3] [len:4] [data] [device_token]
//! fast:    [flags] [len:1] [data] [device_token]
//! ```
//!
//! The device token is either absent or exactly [`DEVICE_TOKEN_LENGTH`]
//! bytes. Extra fields (PSM, instant-connection payload) are appended after
//! the device token behind a bitmask byte and only ever produced through
//! [`BleAdvertisement::to_bytes_with_extra_fields`]; the plain byte form
//! never includes them.

use bitflags::bitflags;
use bytes::Bytes;

use crate::bytes::{ByteReader, ByteWriter};
use crate::hashing::SERVICE_ID_HASH_LENGTH;
use crate::utils::HexSlice;
use crate::Error;

/// Maximum total length of a regular advertisement.
pub const MAX_ADVERTISEMENT_LENGTH: usize = 512;

/// Maximum total length of a fast advertisement.
pub const MAX_FAST_ADVERTISEMENT_LENGTH: usize = 24;

/// Smallest possible regular advertisement (flags + hash + length).
pub const MIN_ADVERTISEMENT_LENGTH: usize = 1 + SERVICE_ID_HASH_LENGTH + 4;

/// Exact size of a present device token.
pub const DEVICE_TOKEN_LENGTH: usize = 2;

enum_with_unknown! {
    /// Advertisement format versions. Versions 1 and 2 are accepted.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum Version(u8) {
        V1 = 1,
        V2 = 2,
    }
}

enum_with_unknown! {
    /// Versions of the BLE socket protocol spoken over the data connection.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum SocketVersion(u8) {
        V1 = 1,
        V2 = 2,
    }
}

fn is_supported_version(version: Version) -> bool {
    matches!(version, Version::V1 | Version::V2)
}

fn is_supported_socket_version(socket_version: SocketVersion) -> bool {
    matches!(socket_version, SocketVersion::V1 | SocketVersion::V2)
}

bitflags! {
    /// Bitmask announcing which extra fields follow the device token.
    struct ExtraFieldMask: u8 {
        const PSM                    = 0x01;
        const INSTANT_CONNECTION_ADV = 0x02;
    }
}

/// A decoded legacy (or fast) BLE advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BleAdvertisement {
    version: Version,
    socket_version: SocketVersion,
    fast_advertisement: bool,
    is_secondary: bool,
    service_id_hash: Bytes,
    data: Bytes,
    device_token: Bytes,
    psm: Option<u16>,
    instant_connection_adv: Option<Bytes>,
}

impl BleAdvertisement {
    /// Creates a regular advertisement carrying a 3-byte service-id hash.
    pub fn new(
        version: Version,
        socket_version: SocketVersion,
        service_id_hash: Bytes,
        data: Bytes,
        device_token: Bytes,
        psm: Option<u16>,
    ) -> Result<Self, Error> {
        if service_id_hash.len() != SERVICE_ID_HASH_LENGTH {
            return Err(Error::LengthMismatch);
        }
        Self::create(
            version,
            socket_version,
            false,
            service_id_hash,
            data,
            device_token,
            psm,
        )
    }

    /// Creates a fast advertisement (no service-id hash; the service is
    /// identified by the service UUID the frame is advertised under).
    pub fn new_fast(
        version: Version,
        socket_version: SocketVersion,
        data: Bytes,
        device_token: Bytes,
    ) -> Result<Self, Error> {
        Self::create(
            version,
            socket_version,
            true,
            Bytes::new(),
            data,
            device_token,
            None,
        )
    }

    fn create(
        version: Version,
        socket_version: SocketVersion,
        fast_advertisement: bool,
        service_id_hash: Bytes,
        data: Bytes,
        device_token: Bytes,
        psm: Option<u16>,
    ) -> Result<Self, Error> {
        if !is_supported_version(version) {
            return Err(Error::UnsupportedVersion);
        }
        if !is_supported_socket_version(socket_version) {
            return Err(Error::UnsupportedVersion);
        }
        if !device_token.is_empty() && device_token.len() != DEVICE_TOKEN_LENGTH {
            return Err(Error::LengthMismatch);
        }

        let length = encoded_length(fast_advertisement, data.len(), device_token.len());
        let max = if fast_advertisement {
            MAX_FAST_ADVERTISEMENT_LENGTH
        } else {
            MAX_ADVERTISEMENT_LENGTH
        };
        if length > max {
            warn!("advertisement would encode to {} bytes, max {}", length, max);
            return Err(Error::FieldOutOfRange);
        }

        Ok(Self {
            version,
            socket_version,
            fast_advertisement,
            is_secondary: false,
            service_id_hash,
            data,
            device_token,
            psm,
            instant_connection_adv: None,
        })
    }

    /// Attaches an instant-connection payload, carried as an extra field.
    pub fn set_instant_connection_adv(&mut self, adv: Bytes) -> Result<(), Error> {
        if adv.len() > u8::max_value() as usize {
            return Err(Error::FieldOutOfRange);
        }
        self.instant_connection_adv = Some(adv);
        Ok(())
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn socket_version(&self) -> SocketVersion {
        self.socket_version
    }

    pub fn is_fast_advertisement(&self) -> bool {
        self.fast_advertisement
    }

    pub fn is_secondary(&self) -> bool {
        self.is_secondary
    }

    /// The 3-byte service-id hash; empty for fast advertisements.
    pub fn service_id_hash(&self) -> &Bytes {
        &self.service_id_hash
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn device_token(&self) -> &Bytes {
        &self.device_token
    }

    pub fn psm(&self) -> Option<u16> {
        self.psm
    }

    pub fn instant_connection_adv(&self) -> Option<&Bytes> {
        self.instant_connection_adv.as_ref()
    }

    /// Decodes an advertisement from its on-wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);

        let version = Version::from(reader.read_bits(3)?);
        if !is_supported_version(version) {
            debug!(
                "unsupported advertisement version in {:?}",
                HexSlice(bytes)
            );
            return Err(Error::UnsupportedVersion);
        }
        let socket_version = SocketVersion::from(reader.read_bits(3)?);
        if !is_supported_socket_version(socket_version) {
            debug!("unsupported socket version in {:?}", HexSlice(bytes));
            return Err(Error::UnsupportedVersion);
        }
        let fast_advertisement = reader.read_bits(1)? != 0;
        let is_secondary = reader.read_bits(1)? != 0;

        let max = if fast_advertisement {
            MAX_FAST_ADVERTISEMENT_LENGTH
        } else {
            MAX_ADVERTISEMENT_LENGTH
        };
        if bytes.len() > max {
            debug!("oversized advertisement: {} bytes, max {}", bytes.len(), max);
            return Err(Error::LengthMismatch);
        }

        let service_id_hash = if fast_advertisement {
            Bytes::new()
        } else {
            reader.read_bytes(SERVICE_ID_HASH_LENGTH)?
        };

        let data_length = if fast_advertisement {
            usize::from(reader.read_u8()?)
        } else {
            reader.read_u32()? as usize
        };
        let data = reader
            .read_bytes(data_length)
            .map_err(|_| Error::LengthMismatch)?;

        let device_token = if reader.is_available(DEVICE_TOKEN_LENGTH) {
            reader.read_bytes(DEVICE_TOKEN_LENGTH)?
        } else {
            Bytes::new()
        };

        let mut psm = None;
        let mut instant_connection_adv = None;
        if reader.is_available(1) {
            let mask = ExtraFieldMask::from_bits_truncate(reader.read_u8()?);
            if mask.contains(ExtraFieldMask::PSM) {
                psm = Some(reader.read_u16()?);
            }
            if mask.contains(ExtraFieldMask::INSTANT_CONNECTION_ADV) {
                let len = usize::from(reader.read_u8()?);
                instant_connection_adv = Some(
                    reader
                        .read_bytes(len)
                        .map_err(|_| Error::LengthMismatch)?,
                );
            }
        }

        Ok(Self {
            version,
            socket_version,
            fast_advertisement,
            is_secondary,
            service_id_hash,
            data,
            device_token,
            psm,
            instant_connection_adv,
        })
    }

    /// Encodes the advertisement without extra fields.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut writer = ByteWriter::new();
        self.write_base(&mut writer)?;
        writer.into_bytes()
    }

    /// Encodes the advertisement with the extra-fields block appended after
    /// the device token. A device token must be present; decoders delimit the
    /// extra fields relative to it.
    pub fn to_bytes_with_extra_fields(&self) -> Result<Bytes, Error> {
        if self.device_token.is_empty() {
            return Err(Error::LengthMismatch);
        }
        let mut writer = ByteWriter::new();
        self.write_base(&mut writer)?;
        self.write_extra_fields(&mut writer)?;
        writer.into_bytes()
    }

    fn write_base(&self, writer: &mut ByteWriter) -> Result<(), Error> {
        writer.write_bits(u8::from(self.version), 3)?;
        writer.write_bits(u8::from(self.socket_version), 3)?;
        writer.write_bits(self.fast_advertisement as u8, 1)?;
        writer.write_bits(self.is_secondary as u8, 1)?;

        if self.fast_advertisement {
            writer.write_u8(self.data.len() as u8)?;
        } else {
            writer.write_slice(&self.service_id_hash)?;
            writer.write_u32(self.data.len() as u32)?;
        }
        writer.write_slice(&self.data)?;
        writer.write_slice(&self.device_token)
    }

    fn write_extra_fields(&self, writer: &mut ByteWriter) -> Result<(), Error> {
        let mut mask = ExtraFieldMask::empty();
        if self.psm.is_some() {
            mask |= ExtraFieldMask::PSM;
        }
        if self.instant_connection_adv.is_some() {
            mask |= ExtraFieldMask::INSTANT_CONNECTION_ADV;
        }
        if mask.is_empty() {
            return Ok(());
        }

        writer.write_u8(mask.bits())?;
        if let Some(psm) = self.psm {
            writer.write_u16(psm)?;
        }
        if let Some(adv) = &self.instant_connection_adv {
            writer.write_u8(adv.len() as u8)?;
            writer.write_slice(adv)?;
        }
        Ok(())
    }
}

fn encoded_length(fast_advertisement: bool, data_len: usize, token_len: usize) -> usize {
    if fast_advertisement {
        1 + 1 + data_len + token_len
    } else {
        1 + SERVICE_ID_HASH_LENGTH + 4 + data_len + token_len
    }
}
