//! Definitions of the Port Control Protocol, the successor of NAT-PMP.
//!
//! PCP requests are recognized by their version so they can be routed away from the NAT-PMP
//! handler. Processing them is not implemented; the option rules are kept here for when it
//! is.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// PCP Version according to [RFC 6887 Version Negotiation](https://datatracker.ietf.org/doc/html/rfc6887#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// PCP, version 2.
    Pcp = 2,
}

/// Opcode as defined in [RFC 6887 IANA Considerations](https://datatracker.ietf.org/doc/html/rfc6887#section-19)
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// Announce Opcode.
    ///
    /// See [RFC 6887 ANNOUNCE Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-14.1)
    Announce = 0,
    /// Map Opcode.
    ///
    /// See [RFC 6887 MAP Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-11)
    Map = 1,
    /// Peer Opcode.
    ///
    /// See [RFC 6887 PEER Opcode](https://datatracker.ietf.org/doc/html/rfc6887#section-12)
    Peer = 2,
}

impl Opcode {
    /// Bit representing this opcode in [`OptionRule::valid_opcodes`].
    pub const fn mask(self) -> u8 {
        1 << self as u8
    }
}

/// Option codes, see [RFC 6887 Options](https://datatracker.ietf.org/doc/html/rfc6887#section-13)
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OptionCode {
    /// Request on behalf of another host.
    ThirdParty = 1,
    /// Fail instead of assigning a different external port.
    PreferFailure = 2,
    /// Restrict which remote peers may use a mapping.
    Filter = 3,
}

/// Constraints on a single option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionRule {
    /// The option these constraints apply to.
    pub code: OptionCode,
    /// Minimum payload length.
    pub min_len: u16,
    /// Maximum payload length.
    pub max_len: u16,
    /// How often the option may appear in one request, `0` means unlimited.
    pub max_count: u8,
    /// Bitmask of [`Opcode::mask`] values the option is valid for.
    pub valid_opcodes: u8,
}

/// The supported options.
pub const OPTION_RULES: [OptionRule; 3] = [
    OptionRule {
        code: OptionCode::ThirdParty,
        min_len: 16,
        max_len: 16,
        max_count: 1,
        valid_opcodes: Opcode::Map.mask() | Opcode::Peer.mask(),
    },
    OptionRule {
        code: OptionCode::PreferFailure,
        min_len: 0,
        max_len: 0,
        max_count: 1,
        valid_opcodes: Opcode::Map.mask(),
    },
    OptionRule {
        code: OptionCode::Filter,
        min_len: 20,
        max_len: 20,
        max_count: 0,
        valid_opcodes: Opcode::Map.mask(),
    },
];

impl OptionRule {
    /// Look up the rule for an option code.
    pub fn find(code: OptionCode) -> Option<&'static OptionRule> {
        OPTION_RULES.iter().find(|rule| rule.code == code)
    }

    /// Whether the option may be attached to a request with this opcode.
    pub fn valid_for(&self, opcode: Opcode) -> bool {
        self.valid_opcodes & opcode.mask() != 0
    }

    /// Whether a payload of `len` bytes appearing for the `count`-th time (starting at 1) is
    /// acceptable.
    pub fn accepts(&self, len: u16, count: u8) -> bool {
        (self.min_len..=self.max_len).contains(&len)
            && (self.max_count == 0 || count <= self.max_count)
    }
}
