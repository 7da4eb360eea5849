//! Definitions and utilities to act as a NAT-PMP server.

mod request;
mod response;

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub use request::*;
pub use response::*;

/// Nat Version according to [RFC 6886 Transition to Port Control Protocol](https://datatracker.ietf.org/doc/html/rfc6886#section-1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// NAT-PMP version
    NatPmp = 0,
}

impl Version {
    /// Highest version this server speaks.
    pub const MAX: Version = Version::NatPmp;
}

/// Opcode accepted by a NAT-PMP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Determine the external address of the gateway.
    ///
    /// See [RFC 6886 Determining the External Address](https://datatracker.ietf.org/doc/html/rfc6886#section-3.2).
    DetermineExternalAddress = 0,
    /// Get a UDP Mapping.
    ///
    /// See [RFC 6886 Requesting a Mapping](https://datatracker.ietf.org/doc/html/rfc6886#section-3.3).
    MapUdp = 1,
    /// Get a TCP Mapping.
    ///
    /// See [RFC 6886 Requesting a Mapping](https://datatracker.ietf.org/doc/html/rfc6886#section-3.3).
    MapTcp = 2,
}

/// Protocol for which a port mapping is requested.
///
/// The discriminant matches the opcode used to request it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MapProtocol {
    /// UDP mapping, requested with [`Opcode::MapUdp`].
    Udp = 1,
    /// TCP mapping, requested with [`Opcode::MapTcp`].
    Tcp = 2,
}

impl MapProtocol {
    /// The mapping protocol served under the other opcode.
    pub fn other(self) -> Self {
        match self {
            MapProtocol::Udp => MapProtocol::Tcp,
            MapProtocol::Tcp => MapProtocol::Udp,
        }
    }

    /// The opcode requesting a mapping for this protocol.
    pub fn opcode(self) -> Opcode {
        match self {
            MapProtocol::Udp => Opcode::MapUdp,
            MapProtocol::Tcp => Opcode::MapTcp,
        }
    }
}

impl fmt::Display for MapProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapProtocol::Udp => f.write_str("UDP"),
            MapProtocol::Tcp => f.write_str("TCP"),
        }
    }
}

/// Indicator ORd into the [`Opcode`] to indicate a response packet.
///
/// A request never carries it.
pub const RESPONSE_INDICATOR: u8 = 1u8 << 7;
