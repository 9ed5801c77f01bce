//! Neighbor Discovery client and server halves
//!
//! The IPv6 counterpart of `arp`: solicitations go to the target's
//! solicited-node group, advertisements answer for owned addresses.

use super::resolver::{ResolverClient, Solicitor};
use crate::protocol::ethernet::build_frame;
use crate::protocol::icmpv6::{
    self, Icmpv6Packet, Icmpv6Type, NeighborAdvertisement, NeighborSolicitation, NDP_HOP_LIMIT,
};
use crate::protocol::ipv4::Protocol;
use crate::protocol::ipv6::{solicited_node_multicast, Ipv6Packet, ALL_NODES_LINK_LOCAL};
use crate::protocol::{EtherType, IpAddress, MacAddr};
use std::net::Ipv6Addr;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Multicasts Neighbor Solicitations onto an interface transmit queue.
pub struct NdSolicitor {
    mac: MacAddr,
    tx: mpsc::Sender<Vec<u8>>,
}

impl NdSolicitor {
    pub fn new(mac: MacAddr, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { mac, tx }
    }
}

impl Solicitor<Ipv6Addr> for NdSolicitor {
    fn solicit(&self, target: Ipv6Addr, source: Ipv6Addr) {
        let group = solicited_node_multicast(target);
        let ns = NeighborSolicitation::new(target, Some(self.mac));
        let packet = icmpv6::encapsulate(source, group, NDP_HOP_LIMIT, ns.to_bytes());
        let frame = build_frame(group.multicast_mac(), self.mac, EtherType::Ipv6, &packet);
        if self.tx.try_send(frame).is_err() {
            warn!(%target, "transmit queue full, neighbor solicitation dropped");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NdServer {
    mac: MacAddr,
}

impl NdServer {
    pub fn new(mac: MacAddr) -> Self {
        Self { mac }
    }

    /// Advertisement frame answering `ns`, received in `packet` from
    /// `frame_src`, when its target is owned.
    pub fn reply_to(
        &self,
        packet: &Ipv6Packet,
        ns: &NeighborSolicitation,
        frame_src: MacAddr,
        owns: impl Fn(Ipv6Addr) -> bool,
    ) -> Option<Vec<u8>> {
        if !owns(ns.target_addr) {
            return None;
        }
        let mut na = NeighborAdvertisement::solicited_reply(ns.target_addr, self.mac);

        // a solicitation from :: (duplicate address detection) is answered to all nodes
        let (dst, dst_mac) = if packet.src_addr().is_unspecified() {
            na.solicited_flag = false;
            (ALL_NODES_LINK_LOCAL, ALL_NODES_LINK_LOCAL.multicast_mac())
        } else {
            (packet.src_addr(), ns.source_link_addr.unwrap_or(frame_src))
        };

        let reply = icmpv6::encapsulate(ns.target_addr, dst, NDP_HOP_LIMIT, na.to_bytes());
        Some(build_frame(dst_mac, self.mac, EtherType::Ipv6, &reply))
    }
}

/// Handle Neighbor Discovery in a received IPv6 packet. Returns None when
/// the packet is not NS/NA, otherwise Some with an optional frame to send
/// back.
pub fn handle_ndp(
    packet: &Ipv6Packet,
    frame_src: MacAddr,
    server: &NdServer,
    client: &ResolverClient<Ipv6Addr>,
) -> Option<Option<Vec<u8>>> {
    if packet.upper_protocol() != Protocol::Icmpv6 as u8 {
        return None;
    }
    let icmp = Icmpv6Packet::parse(packet.upper_payload()).ok()?;
    let kind = Icmpv6Type::from_u8(icmp.msg_type())?;
    if !matches!(
        kind,
        Icmpv6Type::NeighborSolicitation | Icmpv6Type::NeighborAdvertisement
    ) {
        return None;
    }

    if packet.hop_limit() != NDP_HOP_LIMIT {
        debug!(src = %packet.src_addr(), hop_limit = packet.hop_limit(), "dropping off-link neighbor discovery");
        return Some(None);
    }

    match kind {
        Icmpv6Type::NeighborSolicitation => match NeighborSolicitation::parse(icmp.body()) {
            Ok(ns) => {
                trace!(src = %packet.src_addr(), target = %ns.target_addr, "neighbor solicitation rx");
                Some(server.reply_to(packet, &ns, frame_src, |addr| client.owns(addr)))
            }
            Err(e) => {
                debug!(error = %e, "dropping malformed neighbor solicitation");
                Some(None)
            }
        },
        _ => match NeighborAdvertisement::parse(icmp.body()) {
            Ok(na) => {
                let mac = na.target_link_addr.unwrap_or(frame_src);
                trace!(target = %na.target_addr, %mac, "neighbor advertisement rx");
                client.on_reply(na.target_addr, mac);
                Some(None)
            }
            Err(e) => {
                debug!(error = %e, "dropping malformed neighbor advertisement");
                Some(None)
            }
        },
    }
}
