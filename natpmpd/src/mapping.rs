//! The set of live port mappings and their expiry.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

use futures_lite::StreamExt;
use natpmpd_proto::nat_pmp::MapProtocol;
use rand::Rng;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, info, warn};

use crate::{
    defaults::{DYNAMIC_PORTS, MAX_LIFETIME_SECS},
    firewall::Redirect,
};

/// Identifies a mapping: one per protocol and internal endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MappingKey {
    proto: MapProtocol,
    internal: SocketAddrV4,
}

/// A granted port mapping.
#[derive(Debug)]
pub struct Mapping {
    /// Protocol of the mapping.
    pub proto: MapProtocol,
    /// Endpoint of the client on the private network.
    pub internal: SocketAddrV4,
    /// Endpoint advertised to peers.
    pub external: SocketAddrV4,
    expiry: delay_queue::Key,
}

impl Mapping {
    fn redirect(&self) -> Redirect {
        Redirect {
            proto: self.proto,
            internal: self.internal,
            external: self.external,
        }
    }
}

/// What a client is told about its mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    /// Internal port the answer refers to, `0` after deleting all mappings.
    pub internal_port: u16,
    /// External port of the mapping, `0` if nothing is mapped.
    pub external_port: u16,
    /// Lifetime of the mapping in seconds, `0` if nothing is mapped.
    pub lifetime: u32,
    /// Whether the redirect rules need to be rebuilt.
    pub changed: bool,
}

/// Owns all live mappings, each with its own expiry timer.
///
/// Expired mappings are collected with [`MappingStore::next_expired`].
#[derive(Debug, Default)]
pub struct MappingStore {
    mappings: HashMap<MappingKey, Mapping>,
    expiry: DelayQueue<MappingKey>,
}

impl MappingStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    /// Whether there are no live mappings.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// The mapping of `proto` for `internal`, if any.
    pub fn get(&self, proto: MapProtocol, internal: SocketAddrV4) -> Option<&Mapping> {
        self.mappings.get(&MappingKey { proto, internal })
    }

    /// Iterate over all live mappings, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }

    /// The redirects implementing the live mappings, sorted.
    pub fn redirects(&self) -> Vec<Redirect> {
        let mut redirects: Vec<_> = self.mappings.values().map(Mapping::redirect).collect();
        redirects.sort();
        redirects
    }

    /// Handle a mapping request.
    ///
    /// `external` carries the current external address and the port the client asked for.
    ///
    /// | external port | internal port | lifetime | action                                   |
    /// |---------------|---------------|----------|------------------------------------------|
    /// | `0`           | any           | any      | remove all mappings of the client address |
    /// | any           | `0`           | any      | remove all mappings of the client address |
    /// | `> 0`         | `> 0`         | `0`      | remove the mapping of the internal endpoint |
    /// | `> 0`         | `> 0`         | `> 0`    | create or refresh                         |
    ///
    /// A new mapping prefers the external port of a mapping of the other protocol for the
    /// same internal endpoint, or else the requested port. If another mapping of the same
    /// protocol already holds the preferred port, a random port from [`DYNAMIC_PORTS`] is
    /// picked instead.
    pub fn request_mapping(
        &mut self,
        proto: MapProtocol,
        internal: SocketAddrV4,
        external: SocketAddrV4,
        lifetime: u32,
    ) -> Grant {
        if external.port() == 0 || internal.port() == 0 {
            let count = self.remove_all(proto, *internal.ip());
            info!(%proto, client = %internal.ip(), count, "mappings removed");
            return Grant {
                internal_port: 0,
                external_port: 0,
                lifetime: 0,
                changed: count > 0,
            };
        }

        if lifetime == 0 {
            let removed = self.remove(proto, internal);
            if removed {
                info!(%proto, %internal, "mapping removed");
            }
            return Grant {
                internal_port: internal.port(),
                external_port: 0,
                lifetime: 0,
                changed: removed,
            };
        }

        let lifetime = lifetime.min(MAX_LIFETIME_SECS);
        let timeout = Duration::from_secs(lifetime.into());
        let key = MappingKey { proto, internal };

        if let Some(mapping) = self.mappings.get_mut(&key) {
            if mapping.external.port() != external.port() {
                debug!(
                    %proto,
                    %internal,
                    requested = external.port(),
                    existing = mapping.external.port(),
                    "existing mapping with different port"
                );
            }
            // the address drifts when the interface changed while the mapping lived
            let changed = mapping.external.ip() != external.ip();
            if changed {
                mapping.external.set_ip(*external.ip());
            }
            self.expiry.reset(&mapping.expiry, timeout);
            return Grant {
                internal_port: internal.port(),
                external_port: mapping.external.port(),
                lifetime,
                changed,
            };
        }

        let related = self.mappings.get(&MappingKey {
            proto: proto.other(),
            internal,
        });
        let preferred = related.map_or(external.port(), |related| related.external.port());
        let port = if self.port_in_use(proto, preferred) {
            rand::thread_rng().gen_range(DYNAMIC_PORTS)
        } else {
            preferred
        };
        let external = SocketAddrV4::new(*external.ip(), port);
        let expiry = self.expiry.insert(key, timeout);
        self.mappings.insert(
            key,
            Mapping {
                proto,
                internal,
                external,
                expiry,
            },
        );
        debug!(%proto, %external, %internal, lifetime, "mapping created");

        Grant {
            internal_port: internal.port(),
            external_port: port,
            lifetime,
            changed: true,
        }
    }

    fn port_in_use(&self, proto: MapProtocol, port: u16) -> bool {
        self.mappings
            .values()
            .any(|m| m.proto == proto && m.external.port() == port)
    }

    /// Remove the mapping of `proto` for `internal`, returns whether it existed.
    pub fn remove(&mut self, proto: MapProtocol, internal: SocketAddrV4) -> bool {
        match self.mappings.remove(&MappingKey { proto, internal }) {
            Some(mapping) => {
                self.expiry.remove(&mapping.expiry);
                true
            }
            None => false,
        }
    }

    /// Remove all mappings of `proto` for any port of `client`, returns how many there were.
    pub fn remove_all(&mut self, proto: MapProtocol, client: Ipv4Addr) -> usize {
        let keys: Vec<_> = self
            .mappings
            .keys()
            .filter(|key| key.proto == proto && *key.internal.ip() == client)
            .copied()
            .collect();
        for key in &keys {
            if let Some(mapping) = self.mappings.remove(key) {
                self.expiry.remove(&mapping.expiry);
            }
        }
        keys.len()
    }

    /// Remove every mapping, returns how many there were.
    pub fn drain(&mut self) -> usize {
        let count = self.mappings.len();
        self.mappings.clear();
        self.expiry.clear();
        count
    }

    /// Point all mappings at a new external address, returns how many changed.
    pub fn retarget(&mut self, address: Ipv4Addr) -> usize {
        let mut count = 0;
        for mapping in self.mappings.values_mut() {
            if *mapping.external.ip() != address {
                mapping.external.set_ip(address);
                count += 1;
            }
        }
        count
    }

    /// Wait for the next mapping to expire and remove it.
    ///
    /// Returns `None` right away if there are no mappings.
    ///
    /// Cancel safe.
    pub async fn next_expired(&mut self) -> Option<Mapping> {
        let expired = self.expiry.next().await?;
        let key = expired.into_inner();
        let mapping = self.mappings.remove(&key);
        if mapping.is_none() {
            warn!(?key, "expiry fired for unknown mapping");
        }
        mapping
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const EXTERNAL: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    fn internal(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(CLIENT, port)
    }

    fn external(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(EXTERNAL, port)
    }

    /// The timer wheel works in milliseconds.
    fn assert_elapsed(start: tokio::time::Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed <= expected + Duration::from_millis(2),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    #[tokio::test]
    async fn test_create_honors_hint() {
        let mut store = MappingStore::new();
        let grant = store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        assert_eq!(
            grant,
            Grant {
                internal_port: 5000,
                external_port: 6000,
                lifetime: 120,
                changed: true,
            }
        );
        assert_eq!(store.len(), 1);
        let mapping = store.get(MapProtocol::Udp, internal(5000)).unwrap();
        assert_eq!(mapping.external, external(6000));
    }

    #[tokio::test]
    async fn test_refresh_does_not_duplicate() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        let grant = store.request_mapping(MapProtocol::Udp, internal(5000), external(7000), 3600);
        assert_eq!(
            grant,
            Grant {
                internal_port: 5000,
                external_port: 6000,
                lifetime: 3600,
                changed: false,
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_related_mapping_shares_port() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        // asks for a different port, gets the one of the UDP mapping
        let grant = store.request_mapping(MapProtocol::Tcp, internal(5000), external(9999), 120);
        assert_eq!(grant.external_port, 6000);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_related_port_taken_by_other_host() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        let other = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 6), 7000);
        let grant = store.request_mapping(MapProtocol::Tcp, other, external(6000), 120);
        assert_eq!(grant.external_port, 6000);

        // TCP 6000 belongs to the other host now
        let grant = store.request_mapping(MapProtocol::Tcp, internal(5000), external(6000), 120);
        assert_ne!(grant.external_port, 6000);
        assert!(DYNAMIC_PORTS.contains(&grant.external_port));

        let mut tcp_ports: Vec<_> = store
            .redirects()
            .into_iter()
            .filter(|r| r.proto == MapProtocol::Tcp)
            .map(|r| r.external.port())
            .collect();
        tcp_ports.sort();
        tcp_ports.dedup();
        assert_eq!(tcp_ports.len(), 2);
    }

    #[tokio::test]
    async fn test_taken_port_is_randomized() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        let other = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 6), 5000);
        let grant = store.request_mapping(MapProtocol::Udp, other, external(6000), 120);
        assert!(DYNAMIC_PORTS.contains(&grant.external_port));

        // the same port for the other protocol is still free
        let grant = store.request_mapping(MapProtocol::Tcp, other, external(6000), 120);
        assert_ne!(grant.external_port, 0);
    }

    #[tokio::test]
    async fn test_delete_one() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        store.request_mapping(MapProtocol::Udp, internal(5001), external(6001), 120);

        let grant = store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 0);
        assert_eq!(
            grant,
            Grant {
                internal_port: 5000,
                external_port: 0,
                lifetime: 0,
                changed: true,
            }
        );
        assert_eq!(store.len(), 1);

        // nothing left to delete
        let grant = store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 0);
        assert!(!grant.changed);
    }

    #[tokio::test]
    async fn test_delete_all() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        store.request_mapping(MapProtocol::Udp, internal(5001), external(6001), 120);
        store.request_mapping(MapProtocol::Tcp, internal(5000), external(6000), 120);
        let other = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 6), 5000);
        store.request_mapping(MapProtocol::Udp, other, external(6002), 120);

        let grant = store.request_mapping(MapProtocol::Udp, internal(1234), external(0), 0);
        assert_eq!(
            grant,
            Grant {
                internal_port: 0,
                external_port: 0,
                lifetime: 0,
                changed: true,
            }
        );
        // the TCP mapping and the other client are untouched
        assert_eq!(store.len(), 2);
        assert!(store.get(MapProtocol::Tcp, internal(5000)).is_some());
        assert!(store.get(MapProtocol::Udp, other).is_some());

        // internal port 0 deletes all as well
        let grant = store.request_mapping(MapProtocol::Tcp, internal(0), external(6000), 0);
        assert!(grant.changed);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_lifetime_is_clamped() {
        let mut store = MappingStore::new();
        let grant =
            store.request_mapping(MapProtocol::Tcp, internal(22), external(2222), u32::MAX);
        assert_eq!(grant.lifetime, MAX_LIFETIME_SECS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 10);
        store.request_mapping(MapProtocol::Udp, internal(5001), external(6001), 20);

        let start = tokio::time::Instant::now();
        let expired = store.next_expired().await.unwrap();
        assert_eq!(expired.internal, internal(5000));
        assert_elapsed(start, Duration::from_secs(10));
        assert_eq!(store.redirects().len(), 1);

        let expired = store.next_expired().await.unwrap();
        assert_eq!(expired.internal, internal(5001));
        assert!(store.is_empty());
        assert!(store.next_expired().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_resets_timer() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 10);
        tokio::time::advance(Duration::from_secs(8)).await;
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 10);

        let start = tokio::time::Instant::now();
        let expired = store.next_expired().await.unwrap();
        assert_eq!(expired.internal, internal(5000));
        assert_elapsed(start, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retarget_and_drift() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        store.request_mapping(MapProtocol::Tcp, internal(5000), external(6000), 120);

        let new_address = Ipv4Addr::new(198, 51, 100, 7);
        assert_eq!(store.retarget(new_address), 2);
        assert_eq!(store.retarget(new_address), 0);
        assert!(store.iter().all(|m| *m.external.ip() == new_address));

        // a refresh carrying another address moves the mapping along
        let grant = store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        assert!(grant.changed);
        let mapping = store.get(MapProtocol::Udp, internal(5000)).unwrap();
        assert_eq!(mapping.external, external(6000));
    }

    #[tokio::test]
    async fn test_drain() {
        let mut store = MappingStore::new();
        store.request_mapping(MapProtocol::Udp, internal(5000), external(6000), 120);
        store.request_mapping(MapProtocol::Tcp, internal(5000), external(6000), 120);
        assert_eq!(store.drain(), 2);
        assert!(store.is_empty());
        assert!(store.next_expired().await.is_none());
    }
}
