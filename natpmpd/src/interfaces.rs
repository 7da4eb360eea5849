//! Lookup of the external address.

use std::net::Ipv4Addr;

/// Source of interface addresses.
pub trait AddressSource: std::fmt::Debug + Send + 'static {
    /// The first IPv4 address of `interface`, `None` if it has none or does not exist.
    fn ipv4_of(&self, interface: &str) -> Option<Ipv4Addr>;
}

/// Reads the addresses of the host's interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl AddressSource for SystemInterfaces {
    fn ipv4_of(&self, interface: &str) -> Option<Ipv4Addr> {
        netdev::get_interfaces()
            .into_iter()
            .find(|iface| iface.name == interface)
            .and_then(|iface| iface.ipv4.first().map(|net| net.addr()))
    }
}

#[cfg(test)]
pub(crate) use self::fixed::FixedAddress;
