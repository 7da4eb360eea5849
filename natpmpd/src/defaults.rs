//! Default values used by the daemon.

use std::{net::Ipv4Addr, ops::Range, time::Duration};

/// The default path of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/natpmpd.toml";

/// Group address external address announcements are sent to.
pub const ANNOUNCE_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// Delays between the announcements of one burst, the first is sent right away.
///
/// See [RFC 6886 Announcing Address Changes](https://datatracker.ietf.org/doc/html/rfc6886#section-3.2.1).
pub const ANNOUNCE_DELAYS: [Duration; 10] = [
    Duration::ZERO,
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
    Duration::from_secs(32),
    Duration::from_secs(64),
];

/// Ports external mappings are picked from when the client has no usable preference.
pub const DYNAMIC_PORTS: Range<u16> = 49152..65535;

/// Longest lifetime granted to a mapping, one year.
pub const MAX_LIFETIME_SECS: u32 = 365 * 24 * 60 * 60;

/// Contains all timeouts used by the daemon.
pub(crate) mod timeouts {
    use std::time::Duration;

    /// Wait before retrying a commit the firewall reported as busy.
    pub(crate) const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(5);

    /// How often the interface is checked on platforms without change notifications.
    #[cfg(not(target_os = "linux"))]
    pub(crate) const INTERFACE_RECHECK_INTERVAL: Duration = Duration::from_secs(30);
}
