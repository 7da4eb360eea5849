//! A NAT-PMP response encoding and decoding.

use std::net::Ipv4Addr;

use nested_enum_utils::common_fields;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use snafu::{Backtrace, Snafu};

use super::{MapProtocol, Opcode, RESPONSE_INDICATOR, Version};

/// A NAT-PMP Response/Notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Answer to a request carrying a version this server does not speak.
    ///
    /// Always encoded as the bare 8 byte header.
    UnsupportedVersion {
        /// Seconds since the server started.
        epoch_time: u32,
    },
    /// Response to a [`Opcode::DetermineExternalAddress`] request, also sent unsolicited as
    /// an announcement.
    PublicAddress {
        /// Result of the request.
        result: ResultCode,
        /// Seconds since the server started.
        epoch_time: u32,
        /// External address, [`Ipv4Addr::UNSPECIFIED`] when unknown.
        public_ip: Ipv4Addr,
    },
    /// Response to a [`Opcode::MapUdp`] or [`Opcode::MapTcp`] request.
    PortMap {
        /// Protocol for which the mapping was requested.
        proto: MapProtocol,
        /// Result of the request.
        result: ResultCode,
        /// Seconds since the server started.
        epoch_time: u32,
        /// Local port for which the mapping was created.
        private_port: u16,
        /// External port registered for this mapping.
        external_port: u16,
        /// Lifetime in seconds that can be assumed by this mapping.
        lifetime_seconds: u32,
    },
    /// Response to a request with an unknown opcode: the request echoed back.
    UnsupportedOpcode {
        /// The request as received.
        request: Vec<u8>,
    },
}

/// Result code sent in a NAT-PMP response.
///
/// See [RFC 6886 Result Codes](https://datatracker.ietf.org/doc/html/rfc6886#section-3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    /// A successful response.
    Success = 0,
    /// The sent version is not supported by the NAT-PMP server.
    UnsupportedVersion = 1,
    /// Functionality is supported but not allowed: e.g. box supports mapping, but user has
    /// turned feature off.
    NotAuthorizedOrRefused = 2,
    /// Network failures, e.g. NAT device itself has not obtained a DHCP lease.
    NetworkFailure = 3,
    /// NAT-PMP server cannot create any more mappings at this time.
    OutOfResources = 4,
    /// Opcode is not supported by the server.
    UnsupportedOpcode = 5,
}

/// Errors that can occur when decoding a [`Response`], as a client would.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ResponseDecodeError {
    #[snafu(display("response is malformed, has {len} bytes"))]
    Malformed { len: usize },
    #[snafu(display("packet does not appear to be a response"))]
    NotAResponse {},
    #[snafu(display("invalid version {version}"))]
    InvalidVersion { version: u8 },
    #[snafu(display("invalid opcode {opcode}"))]
    InvalidOpcode { opcode: u8 },
    #[snafu(display("invalid result code {code}"))]
    InvalidResultCode { code: u16 },
}

impl Response {
    /// Size of the header every response starts with.
    pub const HEADER_SIZE: usize = // parts:
        1 + // version
        1 + // opcode
        2 + // result code
        4; // epoch time

    /// Size of an encoded [`Response::PublicAddress`].
    pub const PUBLIC_ADDRESS_SIZE: usize = // parts:
        Self::HEADER_SIZE +
        4; // public ip

    /// Size of an encoded [`Response::PortMap`].
    pub const PORT_MAP_SIZE: usize = // parts:
        Self::HEADER_SIZE +
        2 + // private port
        2 + // public port
        4; // lifetime

    /// Build the unsolicited announcement of a new external address.
    pub fn announce(epoch_time: u32, public_ip: Ipv4Addr) -> Self {
        Response::PublicAddress {
            result: ResultCode::Success,
            epoch_time,
            public_ip,
        }
    }

    /// The result code carried by this response.
    pub fn result(&self) -> ResultCode {
        match self {
            Response::UnsupportedVersion { .. } => ResultCode::UnsupportedVersion,
            Response::PublicAddress { result, .. } | Response::PortMap { result, .. } => *result,
            Response::UnsupportedOpcode { .. } => ResultCode::UnsupportedOpcode,
        }
    }

    fn header(buf: &mut Vec<u8>, opcode: u8, result: ResultCode, epoch_time: u32) {
        // version
        buf.push(Version::NatPmp.into());
        // response indicator and opcode
        buf.push(RESPONSE_INDICATOR | opcode);
        // result code
        let result: u16 = result.into();
        buf.extend_from_slice(&result.to_be_bytes());
        // epoch
        buf.extend_from_slice(&epoch_time.to_be_bytes());
    }

    /// Encode the response to be sent on the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::UnsupportedVersion { epoch_time } => {
                let mut buf = Vec::with_capacity(Self::HEADER_SIZE);
                Self::header(&mut buf, 0, ResultCode::UnsupportedVersion, *epoch_time);
                buf
            }
            Response::PublicAddress {
                result,
                epoch_time,
                public_ip,
            } => {
                let mut buf = Vec::with_capacity(Self::PUBLIC_ADDRESS_SIZE);
                Self::header(
                    &mut buf,
                    Opcode::DetermineExternalAddress.into(),
                    *result,
                    *epoch_time,
                );
                buf.extend_from_slice(&public_ip.octets());
                buf
            }
            Response::PortMap {
                proto,
                result,
                epoch_time,
                private_port,
                external_port,
                lifetime_seconds,
            } => {
                let mut buf = Vec::with_capacity(Self::PORT_MAP_SIZE);
                Self::header(&mut buf, proto.opcode().into(), *result, *epoch_time);
                buf.extend_from_slice(&private_port.to_be_bytes());
                buf.extend_from_slice(&external_port.to_be_bytes());
                buf.extend_from_slice(&lifetime_seconds.to_be_bytes());
                buf
            }
            Response::UnsupportedOpcode { request } => {
                let mut buf = request.clone();
                if let Some(opcode) = buf.get_mut(1) {
                    *opcode |= RESPONSE_INDICATOR;
                }
                // the result code overwrites whatever the request had there, within its length
                let result: u16 = ResultCode::UnsupportedOpcode.into();
                for (slot, b) in buf.iter_mut().skip(2).zip(result.to_be_bytes()) {
                    *slot = b;
                }
                buf
            }
        }
    }

    /// Decode a response with a known opcode.
    ///
    /// Echoed [`Response::UnsupportedOpcode`] replies are not recognized.
    pub fn decode(buf: &[u8]) -> Result<Self, ResponseDecodeError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(MalformedSnafu { len: buf.len() }.build());
        }
        let version = buf[0];
        if Version::try_from(version).is_err() {
            return Err(InvalidVersionSnafu { version }.build());
        }
        let opcode = buf[1];
        if opcode & RESPONSE_INDICATOR != RESPONSE_INDICATOR {
            return Err(NotAResponseSnafu.build());
        }
        let opcode = opcode & !RESPONSE_INDICATOR;
        let code = u16::from_be_bytes([buf[2], buf[3]]);
        let result =
            ResultCode::try_from(code).map_err(|_| InvalidResultCodeSnafu { code }.build())?;
        let epoch_time = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if result == ResultCode::UnsupportedVersion && buf.len() == Self::HEADER_SIZE {
            return Ok(Response::UnsupportedVersion { epoch_time });
        }

        let opcode = Opcode::try_from(opcode).map_err(|_| InvalidOpcodeSnafu { opcode }.build())?;
        match opcode {
            Opcode::DetermineExternalAddress => {
                if buf.len() != Self::PUBLIC_ADDRESS_SIZE {
                    return Err(MalformedSnafu { len: buf.len() }.build());
                }
                let public_ip = Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]);
                Ok(Response::PublicAddress {
                    result,
                    epoch_time,
                    public_ip,
                })
            }
            Opcode::MapUdp | Opcode::MapTcp => {
                if buf.len() != Self::PORT_MAP_SIZE {
                    return Err(MalformedSnafu { len: buf.len() }.build());
                }
                let proto = match opcode {
                    Opcode::MapUdp => MapProtocol::Udp,
                    _ => MapProtocol::Tcp,
                };
                Ok(Response::PortMap {
                    proto,
                    result,
                    epoch_time,
                    private_port: u16::from_be_bytes([buf[8], buf[9]]),
                    external_port: u16::from_be_bytes([buf[10], buf[11]]),
                    lifetime_seconds: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
                })
            }
        }
    }
}
