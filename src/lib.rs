//! The BLE discovery core of a peer-to-peer connections stack.
//!
//! This crate covers the two halves of discovering nearby peers over
//! Bluetooth Low Energy:
//!
//! * **Wire codecs** for the on-air and companion formats: the advertisement
//!   header with its service-id bloom filter ([`adv::header`]), the legacy
//!   and fast advertisements ([`adv::legacy`]), the self-contained DCT
//!   advertisement ([`adv::dct`]), forced-loss frames
//!   ([`adv::instant_loss`]), L2CAP control packets ([`l2cap`]) and
//!   socket-framed packets ([`socket`]). All of them are built on the
//!   bit-aware reader/writer in [`bytes`] and fail closed on malformed input.
//!
//! * **The discovered-peripheral tracker** ([`discovery`]), which correlates
//!   sightings across the fast, extended, DCT and GATT delivery paths, rate
//!   limits expensive GATT reads with exponential back-off, and emits stable
//!   found/lost callbacks to the layers above.
//!
//! The radio driver, GATT client and L2CAP socket transports are external
//! collaborators: the tracker consumes sightings through
//! [`discovery::DiscoveredPeripheralTracker::process_found`] and reaches the
//! GATT server only through the caller-supplied fetcher.
//!
//! Enable the `log` cargo feature to route the crate's diagnostics through
//! the `log` crate's macros.

#[macro_use]
mod log;
#[macro_use]
mod utils;

pub mod adv;
pub mod bytes;
pub mod config;
pub mod discovery;
mod error;
pub mod hashing;
pub mod l2cap;
pub mod socket;
pub mod time;
pub mod uuid;

pub use self::error::Error;
pub use self::utils::{CancellationFlag, HexSlice};
