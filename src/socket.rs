//! The socket-framed BLE packet exchanged once a connection is up.
//!
//! Every frame on a BLE socket is prefixed with the 3-byte service-id hash of
//! the service it belongs to:
//!
//! ```text
//! [service_id_hash:3] [data]
//! ```
//!
//! The all-zero hash is reserved: it marks a *control* sub-frame whose data
//! is a protobuf-encoded [`SocketControlFrame`] (introduction, disconnection
//! or packet acknowledgement). An introduction must speak socket version 2;
//! other socket versions are rejected.

use core::convert::TryFrom;

use bytes::Bytes;
use prost::Message;

use crate::adv::legacy::SocketVersion;
use crate::hashing::SERVICE_ID_HASH_LENGTH;
use crate::utils::HexSlice;
use crate::Error;

/// The reserved service-id hash that marks control packets.
pub const CONTROL_PACKET_HASH: [u8; SERVICE_ID_HASH_LENGTH] = [0x00, 0x00, 0x00];

/// Wire messages for the control channel, mirroring the advertising side's
/// protobuf schema. Field numbers are part of the wire contract and must not
/// change.
mod frames {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SocketControlFrame {
        #[prost(enumeration = "ControlFrameType", optional, tag = "1")]
        pub r#type: ::core::option::Option<i32>,
        #[prost(message, optional, tag = "2")]
        pub introduction: ::core::option::Option<IntroductionFrame>,
        #[prost(message, optional, tag = "3")]
        pub disconnection: ::core::option::Option<DisconnectionFrame>,
        #[prost(message, optional, tag = "4")]
        pub packet_acknowledgement: ::core::option::Option<PacketAcknowledgementFrame>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct IntroductionFrame {
        #[prost(bytes = "bytes", optional, tag = "1")]
        pub service_id_hash: ::core::option::Option<::prost::bytes::Bytes>,
        #[prost(enumeration = "SocketVersion", optional, tag = "2")]
        pub socket_version: ::core::option::Option<i32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DisconnectionFrame {
        #[prost(bytes = "bytes", optional, tag = "1")]
        pub service_id_hash: ::core::option::Option<::prost::bytes::Bytes>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PacketAcknowledgementFrame {
        #[prost(bytes = "bytes", optional, tag = "1")]
        pub service_id_hash: ::core::option::Option<::prost::bytes::Bytes>,
        #[prost(int32, optional, tag = "2")]
        pub received_size: ::core::option::Option<i32>,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum ControlFrameType {
        UnknownControlFrameType = 0,
        Introduction = 1,
        Disconnection = 2,
        PacketAcknowledgement = 3,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum SocketVersion {
        UnknownSocketVersion = 0,
        V1 = 1,
        V2 = 2,
    }
}

use frames::{ControlFrameType, SocketControlFrame};

/// A decoded control sub-frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Opens a virtual socket for the hashed service.
    Introduction {
        service_id_hash: Bytes,
        socket_version: SocketVersion,
    },
    /// Closes the virtual socket for the hashed service.
    Disconnection { service_id_hash: Bytes },
    /// Acknowledges `received_size` bytes on the hashed service's socket.
    PacketAcknowledgement {
        service_id_hash: Bytes,
        received_size: i32,
    },
}

/// A decoded socket-framed BLE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlePacket {
    /// Payload bytes addressed to a service.
    Data { service_id_hash: Bytes, data: Bytes },
    /// A control sub-frame (carried under the reserved all-zero hash).
    Control(ControlFrame),
}

fn check_service_id_hash(service_id_hash: &Bytes) -> Result<(), Error> {
    if service_id_hash.len() != SERVICE_ID_HASH_LENGTH {
        return Err(Error::LengthMismatch);
    }
    Ok(())
}

impl BlePacket {
    /// Creates a data packet. The hash must not be the reserved control
    /// marker.
    pub fn new_data(service_id_hash: Bytes, data: Bytes) -> Result<Self, Error> {
        check_service_id_hash(&service_id_hash)?;
        if service_id_hash.as_ref() == CONTROL_PACKET_HASH {
            return Err(Error::FieldOutOfRange);
        }
        Ok(BlePacket::Data {
            service_id_hash,
            data,
        })
    }

    /// Creates an introduction control packet (always socket version 2).
    pub fn new_control_introduction(service_id_hash: Bytes) -> Result<Self, Error> {
        check_service_id_hash(&service_id_hash)?;
        Ok(BlePacket::Control(ControlFrame::Introduction {
            service_id_hash,
            socket_version: SocketVersion::V2,
        }))
    }

    /// Creates a disconnection control packet.
    pub fn new_control_disconnection(service_id_hash: Bytes) -> Result<Self, Error> {
        check_service_id_hash(&service_id_hash)?;
        Ok(BlePacket::Control(ControlFrame::Disconnection {
            service_id_hash,
        }))
    }

    /// Creates a packet-acknowledgement control packet.
    pub fn new_control_packet_acknowledgement(
        service_id_hash: Bytes,
        received_size: i32,
    ) -> Result<Self, Error> {
        check_service_id_hash(&service_id_hash)?;
        Ok(BlePacket::Control(ControlFrame::PacketAcknowledgement {
            service_id_hash,
            received_size,
        }))
    }

    /// The service-id hash this packet is addressed by. For control packets
    /// this is the hash *inside* the control frame, not the zero marker.
    pub fn service_id_hash(&self) -> &Bytes {
        match self {
            BlePacket::Data {
                service_id_hash, ..
            } => service_id_hash,
            BlePacket::Control(frame) => match frame {
                ControlFrame::Introduction {
                    service_id_hash, ..
                }
                | ControlFrame::Disconnection { service_id_hash }
                | ControlFrame::PacketAcknowledgement {
                    service_id_hash, ..
                } => service_id_hash,
            },
        }
    }

    /// Decodes a packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < SERVICE_ID_HASH_LENGTH {
            return Err(Error::InputTooShort);
        }
        let (hash, data) = bytes.split_at(SERVICE_ID_HASH_LENGTH);

        if hash == CONTROL_PACKET_HASH {
            Self::parse_control_frame(data)
        } else {
            Ok(BlePacket::Data {
                service_id_hash: Bytes::copy_from_slice(hash),
                data: Bytes::copy_from_slice(data),
            })
        }
    }

    fn parse_control_frame(data: &[u8]) -> Result<Self, Error> {
        let frame = SocketControlFrame::decode(data).map_err(|_| {
            debug!("undecodable socket control frame: {:?}", HexSlice(data));
            Error::LengthMismatch
        })?;

        // The payload variant must match the type field.
        let frame_type = frame
            .r#type
            .and_then(|raw| ControlFrameType::try_from(raw).ok())
            .ok_or(Error::FieldOutOfRange)?;
        match frame_type {
            ControlFrameType::Introduction => {
                let introduction = frame.introduction.ok_or(Error::FieldOutOfRange)?;
                let socket_version = match introduction.socket_version {
                    Some(v) if v == frames::SocketVersion::V2 as i32 => SocketVersion::V2,
                    _ => return Err(Error::UnsupportedVersion),
                };
                let service_id_hash =
                    introduction.service_id_hash.ok_or(Error::FieldOutOfRange)?;
                check_service_id_hash(&service_id_hash)?;
                Ok(BlePacket::Control(ControlFrame::Introduction {
                    service_id_hash,
                    socket_version,
                }))
            }
            ControlFrameType::Disconnection => {
                let disconnection = frame.disconnection.ok_or(Error::FieldOutOfRange)?;
                let service_id_hash =
                    disconnection.service_id_hash.ok_or(Error::FieldOutOfRange)?;
                check_service_id_hash(&service_id_hash)?;
                Ok(BlePacket::Control(ControlFrame::Disconnection {
                    service_id_hash,
                }))
            }
            ControlFrameType::PacketAcknowledgement => {
                let ack = frame
                    .packet_acknowledgement
                    .ok_or(Error::FieldOutOfRange)?;
                let service_id_hash = ack.service_id_hash.ok_or(Error::FieldOutOfRange)?;
                check_service_id_hash(&service_id_hash)?;
                Ok(BlePacket::Control(ControlFrame::PacketAcknowledgement {
                    service_id_hash,
                    received_size: ack.received_size.unwrap_or(0),
                }))
            }
            ControlFrameType::UnknownControlFrameType => Err(Error::FieldOutOfRange),
        }
    }

    /// Encodes the packet.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut out = Vec::new();
        match self {
            BlePacket::Data {
                service_id_hash,
                data,
            } => {
                out.extend_from_slice(service_id_hash);
                out.extend_from_slice(data);
            }
            BlePacket::Control(control) => {
                out.extend_from_slice(&CONTROL_PACKET_HASH);
                let frame = control.to_proto();
                frame
                    .encode(&mut out)
                    .map_err(|_| Error::FieldOutOfRange)?;
            }
        }
        Ok(out.into())
    }
}

impl ControlFrame {
    fn to_proto(&self) -> SocketControlFrame {
        let mut frame = SocketControlFrame::default();
        match self {
            ControlFrame::Introduction {
                service_id_hash, ..
            } => {
                frame.r#type = Some(ControlFrameType::Introduction as i32);
                frame.introduction = Some(frames::IntroductionFrame {
                    service_id_hash: Some(service_id_hash.clone()),
                    socket_version: Some(frames::SocketVersion::V2 as i32),
                });
            }
            ControlFrame::Disconnection { service_id_hash } => {
                frame.r#type = Some(ControlFrameType::Disconnection as i32);
                frame.disconnection = Some(frames::DisconnectionFrame {
                    service_id_hash: Some(service_id_hash.clone()),
                });
            }
            ControlFrame::PacketAcknowledgement {
                service_id_hash,
                received_size,
            } => {
                frame.r#type = Some(ControlFrameType::PacketAcknowledgement as i32);
                frame.packet_acknowledgement = Some(frames::PacketAcknowledgementFrame {
                    service_id_hash: Some(service_id_hash.clone()),
                    received_size: Some(*received_size),
                });
            }
        }
        frame
    }
}
