//! Wire formats spoken by `natpmpd`.
//!
//! - [`nat_pmp`]: the legacy NAT Port Mapping Protocol, version 0, as described in
//!   [RFC 6886](https://datatracker.ietf.org/doc/html/rfc6886). Requests are decoded into a
//!   tagged [`nat_pmp::Request`] and answered with an encoded [`nat_pmp::Response`].
//! - [`pcp`]: constants of the Port Control Protocol,
//!   [RFC 6887](https://datatracker.ietf.org/doc/html/rfc6887). Only the dispatch boundary
//!   exists, requests are not decoded.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod nat_pmp;
pub mod pcp;

// PCP and NAT-PMP share same ports, reasigned by IANA from the older version to the new one. See
// <https://datatracker.ietf.org/doc/html/rfc6887#section-19>

/// Port the server listens on. This is the one clients direct requests to.
pub const SERVER_PORT: u16 = 5351;

/// Port clients listen on for unsolicited announcements.
pub const CLIENT_PORT: u16 = 5350;

/// Largest datagram either protocol will accept.
///
/// See [RFC 6887 General PCP Operation](https://datatracker.ietf.org/doc/html/rfc6887#section-7).
pub const MAX_PACKET_SIZE: usize = 1100;
