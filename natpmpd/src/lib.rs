//! A NAT-PMP daemon.
//!
//! Clients on the private network ask the daemon for port mappings using the NAT Port
//! Mapping Protocol ([RFC 6886](https://datatracker.ietf.org/doc/html/rfc6886)). Every
//! granted mapping is kept in a [`mapping::MappingStore`] with its own expiry timer, and
//! after every change the whole set is written into the kernel firewall as redirect rules
//! by [`rules::rebuild_rules`].
//!
//! The external address handed out to clients is the first IPv4 address of a configured
//! interface. It is re-read whenever [`netmon`] reports a change on that interface, and
//! each change is announced to the local network by a short multicast burst, see
//! [`announce`].
//!
//! Everything runs in one actor task started by [`server::Server::spawn`], so mappings and
//! daemon state are never mutated concurrently.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod announce;
pub mod config;
pub mod defaults;
pub mod firewall;
pub mod interfaces;
pub mod mapping;
pub mod netmon;
pub mod rules;
pub mod server;

pub use natpmpd_proto as proto;
