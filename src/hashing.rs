//! Hashing helpers shared by the codecs and the discovery tracker.
//!
//! Service ids are matched on the wire through short SHA-256 prefixes; the
//! DCT format instead derives its 2-byte hash through HKDF-SHA256 with fixed
//! salt and info strings so that it cannot collide with the plain scheme.

use bytes::Bytes;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

/// Length of the service-id hash carried by regular advertisements and
/// socket-framed packets.
pub const SERVICE_ID_HASH_LENGTH: usize = 3;

/// Length of the advertisement hash carried by advertisement headers.
pub const ADVERTISEMENT_HASH_LENGTH: usize = 4;

/// Length of the DCT service-id hash.
pub const DCT_SERVICE_ID_HASH_LENGTH: usize = 2;

const DCT_HASH_SALT: &[u8] = b"DCT Protocol";
const DCT_HASH_INFO: &[u8] = b"Service ID Hash";

/// Computes `SHA-256(service_id)[..3]`, the hash advertisers embed so that
/// scanners can match a fetched advertisement to a tracked service id.
///
/// This hashing is not keyed; collisions are possible and are resolved by the
/// caller's per-tracked-service membership test.
pub fn service_id_hash(service_id: &str) -> Bytes {
    sha256_prefix(service_id.as_bytes(), SERVICE_ID_HASH_LENGTH)
}

/// Computes `SHA-256(bytes)[..4]`, the identity under which an advertisement
/// is referenced by headers and forced-loss frames.
pub fn advertisement_hash(advertisement: &[u8]) -> Bytes {
    sha256_prefix(advertisement, ADVERTISEMENT_HASH_LENGTH)
}

/// Derives the 2-byte DCT service-id hash via HKDF-SHA256.
pub fn dct_service_id_hash(service_id: &str) -> Bytes {
    let hk = Hkdf::<Sha256>::new(Some(DCT_HASH_SALT), service_id.as_bytes());
    let mut okm = [0u8; DCT_SERVICE_ID_HASH_LENGTH];
    // Only fails for outputs longer than 255 hash blocks.
    hk.expand(DCT_HASH_INFO, &mut okm)
        .unwrap_or_else(|_| unreachable!("2-byte HKDF output"));
    Bytes::copy_from_slice(&okm)
}

/// Returns the first `len` bytes of `SHA-256(input)`.
pub fn sha256_prefix(input: &[u8], len: usize) -> Bytes {
    let digest = Sha256::digest(input);
    Bytes::copy_from_slice(&digest[..len])
}
