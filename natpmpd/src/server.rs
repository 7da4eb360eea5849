//! The daemon: UDP listeners feeding a single actor that owns all state.
//!
//! Each bound listen endpoint gets a reader task forwarding datagrams to the actor. The
//! actor handles one event at a time: a datagram, an expired mapping, a due announcement
//! or an interface change. It alone touches the mappings, the firewall and the external
//! address.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use natpmpd_proto::{
    CLIENT_PORT, MAX_PACKET_SIZE,
    nat_pmp::{DecodeError, MapProtocol, RESPONSE_INDICATOR, Request, Response, ResultCode},
    pcp,
};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    task::{JoinError, JoinSet},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::{
    announce::{Announcer, announcement},
    config::Config,
    defaults::ANNOUNCE_GROUP,
    firewall::{Firewall, FirewallError, NftFirewall},
    interfaces::{AddressSource, SystemInterfaces},
    mapping::{Mapping, MappingStore},
    netmon::{InterfaceEvent, Monitor, MonitorError},
    rules::{SyncError, rebuild_rules},
};

/// Capacity of the channel between the listeners and the daemon.
const DATAGRAM_CHANNEL_CAPACITY: usize = 64;
/// Capacity of the channel between the interface monitor and the daemon.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Failure to start the daemon.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum SpawnError {
    #[snafu(display("failed to initialize the firewall"))]
    FirewallInit { source: FirewallError },
    #[snafu(display("failed to install the initial ruleset"))]
    InitialSync { source: SyncError },
    #[snafu(display("none of the listen addresses could be bound"))]
    NoListeners {},
    #[snafu(display("failed to watch the external interface"))]
    InterfaceMonitor { source: MonitorError },
}

/// A running daemon.
///
/// Dropping it aborts all tasks without touching the firewall, use [`Server::shutdown`]
/// to remove the installed rules.
#[derive(Debug)]
pub struct Server {
    local_addrs: Vec<SocketAddr>,
    cancel: CancellationToken,
    actor: AbortOnDropHandle<()>,
}

impl Server {
    /// Start the daemon described by `config`.
    ///
    /// Rules are written with `nft` and the external address is read from the host's
    /// interfaces. The firewall is reset and initialized before any listener is bound,
    /// failing that is fatal.
    pub async fn spawn(config: &Config) -> Result<Self, SpawnError> {
        let firewall = NftFirewall::new(config.firewall.clone());
        Self::spawn_with(
            config.interface.clone(),
            &config.listen,
            Box::new(firewall),
            Box::new(SystemInterfaces),
            true,
        )
        .await
    }

    async fn spawn_with(
        interface: String,
        listen: &[SocketAddr],
        mut firewall: Box<dyn Firewall>,
        addresses: Box<dyn AddressSource>,
        watch_interface: bool,
    ) -> Result<Self, SpawnError> {
        firewall.init(true).await.context(FirewallInitSnafu)?;
        rebuild_rules(firewall.as_mut(), &[])
            .await
            .context(InitialSyncSnafu)?;

        let mut listeners = Vec::with_capacity(listen.len());
        for addr in listen {
            match bind_listener(*addr) {
                Ok(socket) => {
                    let local_addr = socket.local_addr().unwrap_or(*addr);
                    info!(%local_addr, "listening");
                    listeners.push(Listener {
                        socket: Arc::new(socket),
                        local_addr,
                    });
                }
                Err(err) => warn!(%addr, "failed to bind listen address: {err}"),
            }
        }
        if listeners.is_empty() {
            return Err(NoListenersSnafu.build());
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let monitor = if watch_interface {
            let monitor =
                Monitor::spawn(interface.clone(), event_tx).context(InterfaceMonitorSnafu)?;
            Some(monitor)
        } else {
            None
        };

        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let mut readers = JoinSet::new();
        for (index, listener) in listeners.iter().enumerate() {
            readers.spawn(
                read_datagrams(index, listener.socket.clone(), datagram_tx.clone())
                    .instrument(info_span!("listener", addr = %listener.local_addr)),
            );
        }
        drop(datagram_tx);

        let local_addrs = listeners.iter().map(|l| l.local_addr).collect();
        let mut daemon = Daemon::new(interface, listeners, firewall, addresses);
        daemon.readers = readers;
        daemon.monitor = monitor;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            daemon
                .run(datagram_rx, event_rx, cancel.clone())
                .instrument(info_span!("natpmpd")),
        );

        Ok(Self {
            local_addrs,
            cancel,
            actor: AbortOnDropHandle::new(task),
        })
    }

    /// The addresses actually bound, in the order they were configured.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop serving, remove all mappings and their rules, and wait for the daemon to finish.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.actor.await
    }

    /// Returns the handle for the daemon task.
    ///
    /// The task only finishes on its own if it panicked.
    pub fn task_handle(&mut self) -> &mut AbortOnDropHandle<()> {
        &mut self.actor
    }
}

/// A bound listen endpoint.
#[derive(Debug)]
struct Listener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

/// A datagram received by the listener with index `listener`.
#[derive(Debug)]
struct Datagram {
    listener: usize,
    packet: Vec<u8>,
    src: SocketAddr,
}

fn bind_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    match addr {
        SocketAddr::V4(addr) => {
            socket.set_multicast_if_v4(addr.ip())?;
            socket.set_multicast_loop_v4(false)?;
        }
        SocketAddr::V6(_) => {
            socket.set_only_v6(true)?;
            socket.set_multicast_loop_v6(false)?;
        }
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(socket)
}

async fn read_datagrams(listener: usize, socket: Arc<UdpSocket>, sender: mpsc::Sender<Datagram>) {
    // one byte more than allowed, to tell oversized datagrams apart
    let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(res) => res,
            Err(err) => {
                warn!("failed to receive: {err}");
                continue;
            }
        };
        let datagram = Datagram {
            listener,
            packet: buf[..len].to_vec(),
            src,
        };
        if sender.send(datagram).await.is_err() {
            debug!("daemon gone, stopping");
            break;
        }
    }
}

/// All state of the daemon, owned by its actor task.
#[derive(derive_more::Debug)]
struct Daemon {
    interface: String,
    /// The external address, `None` while the interface has no IPv4 address.
    address: Option<Ipv4Addr>,
    /// Origin of the seconds-since-start epoch.
    started: Instant,
    store: MappingStore,
    announcer: Announcer,
    firewall: Box<dyn Firewall>,
    addresses: Box<dyn AddressSource>,
    listeners: Vec<Listener>,
    #[debug("JoinSet<()>")]
    readers: JoinSet<()>,
    monitor: Option<Monitor>,
}

impl Daemon {
    fn new(
        interface: String,
        listeners: Vec<Listener>,
        firewall: Box<dyn Firewall>,
        addresses: Box<dyn AddressSource>,
    ) -> Self {
        Self {
            interface,
            address: None,
            started: Instant::now(),
            store: MappingStore::new(),
            announcer: Announcer::new(),
            firewall,
            addresses,
            listeners,
            readers: JoinSet::new(),
            monitor: None,
        }
    }

    async fn run(
        mut self,
        mut datagrams: mpsc::Receiver<Datagram>,
        mut events: mpsc::Receiver<InterfaceEvent>,
        cancel: CancellationToken,
    ) {
        self.check_interface().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("shutdown requested");
                    break;
                }
                // timers before requests
                Some(mapping) = self.store.next_expired() => {
                    self.on_expired(mapping).await;
                }
                _ = self.announcer.wait() => {
                    self.announce().await;
                }
                Some(Datagram { listener, packet, src }) = datagrams.recv() => {
                    if let Some(reply) = self.handle_packet(&packet, src).await {
                        if let Some(listener) = self.listeners.get(listener) {
                            if let Err(err) = listener.socket.send_to(&reply, src).await {
                                warn!(%src, "failed to send reply: {err}");
                            }
                        }
                    }
                }
                Some(event) = events.recv() => {
                    trace!(?event, "interface event");
                    self.check_interface().await;
                }
            }
        }

        self.readers.abort_all();
        self.monitor = None;
        let count = self.store.drain();
        info!(count, "removing all mappings");
        self.sync_rules().await;
    }

    /// Seconds since the daemon started.
    fn epoch_time(&self) -> u32 {
        u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX)
    }

    /// Handle one datagram, returning the reply to send back, if any.
    async fn handle_packet(&mut self, packet: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
        if packet.len() < Request::HEADER_SIZE {
            trace!(%src, len = packet.len(), "dropping short packet");
            return None;
        }
        if packet.len() > MAX_PACKET_SIZE {
            debug!(%src, len = packet.len(), "dropping oversized packet");
            return None;
        }
        if packet[1] & RESPONSE_INDICATOR != 0 {
            debug!(%src, opcode = packet[1], "dropping packet with the response bit set");
            return None;
        }
        if pcp::Version::try_from(packet[0]).is_ok() {
            // not implemented, PCP clients fall back to NAT-PMP
            trace!(%src, "dropping PCP request");
            return None;
        }

        let SocketAddr::V4(client) = src else {
            trace!(%src, "dropping NAT-PMP request from IPv6 client");
            return None;
        };

        let request = match Request::decode(packet) {
            Ok(request) => request,
            Err(DecodeError::UnsupportedVersion { version, .. }) => {
                warn!(%src, version, "bad version request");
                let response = Response::UnsupportedVersion {
                    epoch_time: self.epoch_time(),
                };
                return Some(response.encode());
            }
            Err(err) => {
                warn!(%src, "invalid request: {err}");
                return None;
            }
        };

        let response = match request {
            Request::ExternalAddress => match self.address {
                Some(public_ip) => Response::PublicAddress {
                    result: ResultCode::Success,
                    epoch_time: self.epoch_time(),
                    public_ip,
                },
                None => Response::PublicAddress {
                    result: ResultCode::NetworkFailure,
                    epoch_time: self.epoch_time(),
                    public_ip: Ipv4Addr::UNSPECIFIED,
                },
            },
            Request::Mapping {
                proto,
                local_port,
                external_port,
                lifetime_seconds,
            } => {
                let client = *client.ip();
                self.handle_mapping(proto, client, local_port, external_port, lifetime_seconds)
                    .await
            }
            Request::Unsupported { opcode, packet } => {
                debug!(%src, opcode, "unsupported opcode");
                Response::UnsupportedOpcode { request: packet }
            }
        };
        Some(response.encode())
    }

    async fn handle_mapping(
        &mut self,
        proto: MapProtocol,
        client: Ipv4Addr,
        local_port: u16,
        external_port: u16,
        lifetime: u32,
    ) -> Response {
        let Some(address) = self.address else {
            debug!(%proto, %client, "no external address, refusing mapping");
            return Response::PortMap {
                proto,
                result: ResultCode::NetworkFailure,
                epoch_time: self.epoch_time(),
                private_port: local_port,
                external_port: 0,
                lifetime_seconds: 0,
            };
        };

        let internal = SocketAddrV4::new(client, local_port);
        let external = SocketAddrV4::new(address, external_port);
        info!(%proto, %external, %internal, lifetime, "mapping request");

        let grant = self
            .store
            .request_mapping(proto, internal, external, lifetime);
        if grant.changed {
            self.sync_rules().await;
        }

        Response::PortMap {
            proto,
            result: ResultCode::Success,
            epoch_time: self.epoch_time(),
            private_port: grant.internal_port,
            external_port: grant.external_port,
            lifetime_seconds: grant.lifetime,
        }
    }

    async fn on_expired(&mut self, mapping: Mapping) {
        info!(
            proto = %mapping.proto,
            external = %mapping.external,
            internal = %mapping.internal,
            "expiring mapping"
        );
        self.sync_rules().await;
    }

    /// Replace the firewall rules with the live mappings.
    ///
    /// Failures are only logged, the next successful sync catches up.
    async fn sync_rules(&mut self) {
        let redirects = self.store.redirects();
        if let Err(err) = rebuild_rules(self.firewall.as_mut(), &redirects).await {
            warn!("unable to rebuild ruleset: {err}");
        }
    }

    /// Re-read the external address and act on a change.
    async fn check_interface(&mut self) {
        let address = self
            .addresses
            .ipv4_of(&self.interface)
            .filter(|addr| !addr.is_unspecified());
        if address == self.address {
            return;
        }
        info!(
            interface = %self.interface,
            old = ?self.address,
            new = ?address,
            "external address changed"
        );
        self.address = address;
        self.announcer.cancel();

        match address {
            None => {
                let count = self.store.drain();
                if count > 0 {
                    info!(count, "interface lost its address, mappings removed");
                    self.sync_rules().await;
                }
            }
            Some(address) => {
                if self.store.retarget(address) > 0 {
                    self.sync_rules().await;
                }
                self.announcer.restart();
            }
        }
    }

    /// Send the due announcement on every IPv4 listener.
    async fn announce(&mut self) {
        if let Some(address) = self.address {
            let packet = announcement(self.epoch_time(), address);
            let dst = SocketAddr::new(IpAddr::V4(ANNOUNCE_GROUP), CLIENT_PORT);
            debug!(%address, n = self.announcer.sent(), "announcing external address");
            for listener in self.listeners.iter().filter(|l| l.local_addr.is_ipv4()) {
                if let Err(err) = listener.socket.send_to(&packet, dst).await {
                    warn!(local_addr = %listener.local_addr, "failed to send announcement: {err}");
                }
            }
        }
        self.announcer.advance();
    }
}
