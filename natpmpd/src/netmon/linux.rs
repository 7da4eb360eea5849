use futures_lite::StreamExt;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::{
    AddressFamily, RouteNetlinkMessage, address::AddressAttribute, link::LinkAttribute,
};
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::{
    constants::{RTMGRP_IPV4_IFADDR, RTMGRP_LINK},
    new_connection,
};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info_span, trace, warn};

use super::{InterfaceEvent, MonitorError, SocketSnafu};

macro_rules! get_nla {
    ($msg:expr, $nla:path) => {
        $msg.attributes.iter().find_map(|nla| match nla {
            $nla(n) => Some(n),
            _ => None,
        })
    };
}

pub(super) fn spawn(
    interface: String,
    sender: mpsc::Sender<InterfaceEvent>,
) -> Result<Vec<AbortOnDropHandle<()>>, MonitorError> {
    let (mut conn, _handle, mut messages) = new_connection().context(SocketSnafu)?;

    let addr = SocketAddr::new(0, RTMGRP_IPV4_IFADDR | RTMGRP_LINK);
    conn.socket_mut()
        .socket_mut()
        .bind(&addr)
        .context(SocketSnafu)?;

    let conn_task = tokio::spawn(conn);
    let task = tokio::spawn(
        async move {
            while let Some((message, _)) = messages.next().await {
                match message.payload {
                    NetlinkPayload::InnerMessage(msg) => {
                        trace!(?msg, "route message");
                        if let Some(event) = classify(&msg, &interface) {
                            debug!(?event, %interface, "interface changed");
                            if sender.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    NetlinkPayload::Error(err) => {
                        warn!("error reading netlink payload: {:?}", err);
                    }
                    _ => {}
                }
            }
            debug!("route monitor stopped");
        }
        .instrument(info_span!("netmon.linux")),
    );

    Ok(vec![
        AbortOnDropHandle::new(conn_task),
        AbortOnDropHandle::new(task),
    ])
}

/// Address labels are the interface name, optionally followed by `:alias`.
fn label_matches(label: &str, interface: &str) -> bool {
    match label.strip_prefix(interface) {
        Some(rest) => rest.is_empty() || rest.starts_with(':'),
        None => false,
    }
}

fn classify(msg: &RouteNetlinkMessage, interface: &str) -> Option<InterfaceEvent> {
    match msg {
        RouteNetlinkMessage::NewAddress(msg) | RouteNetlinkMessage::DelAddress(msg) => {
            if msg.header.family != AddressFamily::Inet {
                return None;
            }
            match get_nla!(msg, AddressAttribute::Label) {
                Some(label) if !label_matches(label, interface) => None,
                _ => Some(InterfaceEvent::AddressChanged),
            }
        }
        RouteNetlinkMessage::DelLink(msg) => {
            let name = get_nla!(msg, LinkAttribute::IfName)?;
            (name == interface).then_some(InterfaceEvent::Departed)
        }
        _ => None,
    }
}
