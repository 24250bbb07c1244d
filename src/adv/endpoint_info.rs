//! Reading the human-readable device name out of endpoint info.
//!
//! The endpoint info carried in advertisement payloads is owned by the layer
//! above, but its leading fields are stable enough to mine for a display
//! name:
//!
//! ```text
//! [version:3 | has_device_name:1 | device_type:4] [metadata:16] [name_len:1] [utf-8 name]
//! ```
//!
//! Only version 1 payloads are understood; anything else is rejected rather
//! than guessed at.

use crate::bytes::ByteReader;
use crate::Error;

const ENDPOINT_INFO_VERSION: u8 = 1;
const METADATA_LENGTH: usize = 16;

/// Extracts the device name from an endpoint-info payload.
pub fn read_device_name(endpoint_info: &[u8]) -> Result<String, Error> {
    let mut reader = ByteReader::new(endpoint_info);

    let version = reader.read_bits(3)?;
    if version != ENDPOINT_INFO_VERSION {
        return Err(Error::UnsupportedVersion);
    }

    let has_device_name = reader.read_bits(1)? != 0;
    let _device_type = reader.read_bits(4)?;
    if !has_device_name {
        return Err(Error::FieldOutOfRange);
    }

    reader.read_slice(METADATA_LENGTH)?;

    let name_length = usize::from(reader.read_u8()?);
    if name_length == 0 {
        return Err(Error::FieldOutOfRange);
    }
    let name = reader.read_slice(name_length)?;

    String::from_utf8(name.to_vec()).map_err(|_| Error::InvalidUtf8)
}
