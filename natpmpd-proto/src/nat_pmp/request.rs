//! A NAT-PMP request encoding and decoding.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

use super::{MapProtocol, Opcode, RESPONSE_INDICATOR, Version};
use crate::MAX_PACKET_SIZE;

/// A NAT-PMP Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Request for the external address of the gateway.
    ExternalAddress,
    /// Request to create, refresh or delete mappings.
    Mapping {
        /// Protocol for which the mapping is requested.
        proto: MapProtocol,
        /// Internal port of the requesting client.
        local_port: u16,
        /// External port the client would like to get.
        external_port: u16,
        /// Requested lifetime, `0` deletes.
        lifetime_seconds: u32,
    },
    /// A well formed request with an opcode this server does not implement.
    ///
    /// The raw packet is kept since the reply echoes it.
    Unsupported {
        /// The opcode as received.
        opcode: u8,
        /// The full request.
        packet: Vec<u8>,
    },
}

/// Errors that can occur when decoding a [`Request`] sent by a client.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display("packet is too short, has {len} bytes"))]
    TooShort { len: usize },
    #[snafu(display("packet is too large, has {len} bytes"))]
    TooLarge { len: usize },
    #[snafu(display("opcode {opcode:#04x} has the response indicator set"))]
    IsResponse { opcode: u8 },
    #[snafu(display("version {version} is not supported"))]
    UnsupportedVersion { version: u8 },
    #[snafu(display("{opcode:?} request must have {expected} bytes, got {len}"))]
    WrongSize {
        opcode: Opcode,
        expected: usize,
        len: usize,
    },
}

impl Request {
    /// Size of the header common to every request.
    pub const HEADER_SIZE: usize = // parts:
        1 + // version
        1; // opcode

    /// Size of an encoded [`Request::Mapping`].
    pub const MAPPING_SIZE: usize = // parts:
        Self::HEADER_SIZE +
        2 + // reserved
        2 + // internal port
        2 + // external port
        4; // lifetime

    /// Decode a request.
    ///
    /// Only the exact sizes of [RFC 6886](https://datatracker.ietf.org/doc/html/rfc6886)
    /// are accepted for known opcodes.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(TooShortSnafu { len: buf.len() }.build());
        }
        if buf.len() > MAX_PACKET_SIZE {
            return Err(TooLargeSnafu { len: buf.len() }.build());
        }
        let (version, opcode) = (buf[0], buf[1]);
        if opcode & RESPONSE_INDICATOR != 0 {
            return Err(IsResponseSnafu { opcode }.build());
        }
        if Version::try_from(version).is_err() {
            return Err(UnsupportedVersionSnafu { version }.build());
        }

        let opcode = match Opcode::try_from(opcode) {
            Ok(opcode) => opcode,
            Err(_) => {
                return Ok(Request::Unsupported {
                    opcode,
                    packet: buf.to_vec(),
                });
            }
        };

        match opcode {
            Opcode::DetermineExternalAddress => {
                if buf.len() != Self::HEADER_SIZE {
                    return Err(WrongSizeSnafu {
                        opcode,
                        expected: Self::HEADER_SIZE,
                        len: buf.len(),
                    }
                    .build());
                }
                Ok(Request::ExternalAddress)
            }
            Opcode::MapUdp | Opcode::MapTcp => {
                if buf.len() != Self::MAPPING_SIZE {
                    return Err(WrongSizeSnafu {
                        opcode,
                        expected: Self::MAPPING_SIZE,
                        len: buf.len(),
                    }
                    .build());
                }
                let proto = match opcode {
                    Opcode::MapUdp => MapProtocol::Udp,
                    _ => MapProtocol::Tcp,
                };
                // bytes 2..4 are reserved
                let local_port = u16::from_be_bytes([buf[4], buf[5]]);
                let external_port = u16::from_be_bytes([buf[6], buf[7]]);
                let lifetime_seconds = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
                Ok(Request::Mapping {
                    proto,
                    local_port,
                    external_port,
                    lifetime_seconds,
                })
            }
        }
    }

    /// Encode the request, as a client would send it.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::ExternalAddress => vec![
                Version::NatPmp.into(),
                Opcode::DetermineExternalAddress.into(),
            ],
            Request::Mapping {
                proto,
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = Vec::with_capacity(Self::MAPPING_SIZE);
                buf.push(Version::NatPmp.into());
                buf.push(proto.opcode().into());
                // reserved
                buf.push(0);
                buf.push(0);
                buf.extend_from_slice(&local_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
            Request::Unsupported { packet, .. } => packet.clone(),
        }
    }
}
