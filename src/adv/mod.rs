//! The on-air advertisement formats.
//!
//! Discovery traffic is spread over several version-gated, bit-packed frame
//! families: the [`header`] that gates GATT reads, the [`legacy`]
//! advertisement fetched through them (or delivered directly in its fast
//! form), the self-contained [`dct`] advertisement, and the [`instant_loss`]
//! frame that withdraws advertisements without waiting for sweep timeouts.
//!
//! All decoders here are fed adversarial input straight from the radio; they
//! fail closed with a typed [`Error`](crate::Error) and leave no partial
//! state behind.

pub mod bloom;
pub mod data_element;
pub mod dct;
pub mod endpoint_info;
pub mod header;
pub mod instant_loss;
pub mod legacy;
