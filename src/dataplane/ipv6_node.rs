//! IPv6 node
//!
//! IPv6 specifics on top of `NodeCore`: solicited-node and all-nodes
//! groups, Segment Routing Header endpoint behavior, ICMPv6 echo and errors.

use super::interface::{same_interface, IfAddr, InterfaceListener, InterfaceRef};
use super::node::{NodeConfig, NodeCore, PacketHandler, ProtocolHandlers};
use super::policy::{DefaultPolicy, ForwardingPolicy, IcmpErrorKind, Verdict};
use super::routing::{Destination, Route, RouteSource, RoutingTable};
use super::{read, write};
use crate::protocol::icmpv6::{self, dest_unreachable, time_exceeded, Icmpv6Packet, Icmpv6Type};
use crate::protocol::ipv4::Protocol;
use crate::protocol::ipv6::{
    ext, solicited_node_multicast, Ipv6Packet, ALL_NODES_INTERFACE_LOCAL, ALL_NODES_LINK_LOCAL,
    DEFAULT_HOP_LIMIT,
};
use crate::telemetry::MetricsRegistry;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, RwLock, Weak};
use tracing::{debug, info, trace};

pub struct Ipv6Node {
    core: NodeCore<Ipv6Addr>,
    policy: RwLock<Arc<dyn ForwardingPolicy<Ipv6Packet>>>,
    handlers: ProtocolHandlers<Ipv6Packet>,
    send_icmp_dest_unreachable: AtomicBool,
    self_ref: Weak<Ipv6Node>,
}

impl Ipv6Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        Self::with_metrics(config, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_metrics(config: NodeConfig, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        let node = Arc::new_cyclic(|self_ref| Self {
            core: NodeCore::new(config.forwarding, metrics),
            policy: RwLock::new(Arc::new(DefaultPolicy)),
            handlers: ProtocolHandlers::default(),
            send_icmp_dest_unreachable: AtomicBool::new(config.send_icmp_dest_unreachable),
            self_ref: self_ref.clone(),
        });
        node.core.loopback().add_listener(node.listener());
        node
    }

    fn listener(&self) -> Weak<dyn InterfaceListener<Ipv6Addr>> {
        self.self_ref.clone()
    }

    pub fn core(&self) -> &NodeCore<Ipv6Addr> {
        &self.core
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.core.metrics()
    }

    pub fn policy(&self) -> Arc<dyn ForwardingPolicy<Ipv6Packet>> {
        read(&self.policy).clone()
    }

    pub fn set_policy(&self, policy: Arc<dyn ForwardingPolicy<Ipv6Packet>>) {
        *write(&self.policy) = policy;
    }

    pub fn set_listener(&self, protocol: u8, handler: Arc<dyn PacketHandler<Ipv6Packet>>) {
        self.handlers.set(protocol, handler);
    }

    pub fn remove_listener(&self, protocol: u8) -> bool {
        self.handlers.remove(protocol)
    }

    pub fn forwarding(&self) -> bool {
        self.core.forwarding()
    }

    pub fn set_forwarding(&self, enabled: bool) {
        self.core.set_forwarding(enabled);
    }

    pub fn set_send_icmp_dest_unreachable(&self, enabled: bool) {
        self.send_icmp_dest_unreachable.store(enabled, Ordering::Relaxed);
    }

    pub fn routing_table(&self) -> MutexGuard<'_, RoutingTable<Ipv6Addr>> {
        self.core.routing_table()
    }

    pub fn interfaces(&self) -> Vec<InterfaceRef<Ipv6Addr>> {
        self.core.interfaces()
    }

    pub fn address(&self) -> Option<Ipv6Addr> {
        self.core.address()
    }

    pub fn addresses(&self) -> Vec<Ipv6Addr> {
        self.core.addresses()
    }

    pub fn has_address(&self, addr: Ipv6Addr) -> bool {
        self.core.has_address(addr)
    }

    pub fn source_address(&self, dst: Ipv6Addr) -> Option<Ipv6Addr> {
        self.core.source_address(dst)
    }

    pub fn add_interface(&self, iface: InterfaceRef<Ipv6Addr>) {
        self.core.attach(iface.clone(), &self.listener());
        for addr in iface.addresses().into_iter().filter(IfAddr::is_unicast) {
            self.install_address(&iface, addr);
        }
        info!(iface = %iface.name(), "ipv6 interface added");
    }

    pub fn remove_interface(&self, iface: &InterfaceRef<Ipv6Addr>) -> bool {
        self.core.detach(iface, &self.listener())
    }

    pub fn add_address(&self, iface: &InterfaceRef<Ipv6Addr>, addr: IfAddr<Ipv6Addr>) {
        iface.add_address(addr);
        if addr.is_unicast() {
            self.install_address(iface, addr);
        }
        info!(iface = %iface.name(), addr = %addr, "ipv6 address added");
    }

    fn install_address(&self, iface: &InterfaceRef<Ipv6Addr>, addr: IfAddr<Ipv6Addr>) {
        iface.add_address(IfAddr::multicast(solicited_node_multicast(addr.addr)));
        if let Some(prefix) = addr.prefix() {
            let mut routing = self.core.routing_table();
            let dest = Destination::Prefix(prefix);
            let present = routing
                .routes()
                .iter()
                .any(|r| r.destination == dest && same_interface(&r.interface, iface));
            if !present {
                routing.add(Route::connected(prefix, iface.clone()));
            }
            self.core.metrics().set_route_count(routing.len());
        }
        iface.add_address(IfAddr::multicast(ALL_NODES_INTERFACE_LOCAL));
        iface.add_address(IfAddr::multicast(ALL_NODES_LINK_LOCAL));
    }

    pub fn remove_address(&self, iface: &InterfaceRef<Ipv6Addr>, addr: Ipv6Addr) -> bool {
        let Some(entry) = iface.addresses().into_iter().find(|a| a.addr == addr) else {
            return false;
        };
        iface.remove_address(addr);

        let group = solicited_node_multicast(addr);
        let group_used = iface
            .addresses()
            .iter()
            .any(|a| a.is_unicast() && solicited_node_multicast(a.addr) == group);
        if !group_used {
            iface.remove_address(group);
        }

        if let Some(prefix) = entry.prefix() {
            if !iface.addresses().iter().any(|a| a.prefix() == Some(prefix)) {
                let mut routing = self.core.routing_table();
                routing.retain(|r| {
                    !(r.source == RouteSource::Connected
                        && r.destination == Destination::Prefix(prefix)
                        && same_interface(&r.interface, iface))
                });
                self.core.metrics().set_route_count(routing.len());
            }
        }
        info!(iface = %iface.name(), addr = %addr, "ipv6 address removed");
        true
    }

    pub fn receive(&self, iface: &InterfaceRef<Ipv6Addr>, data: &[u8]) {
        let metrics = self.core.metrics();
        metrics.record_rx(&iface.name(), data.len());

        let packet = match Ipv6Packet::from_bytes(data) {
            Ok(p) => p,
            Err(e) => {
                debug!(iface = %iface.name(), error = %e, "dropping malformed ipv6 packet");
                metrics.record_rx_drop(&iface.name());
                metrics.packets_dropped.inc();
                return;
            }
        };

        let policy = self.policy();
        let Some(packet) = policy.on_receive(&self.core, iface, packet) else {
            return;
        };

        match policy.classify(&self.core, &packet) {
            Verdict::Local => self.process_local(iface, packet),
            Verdict::Forward => self.forward(policy.as_ref(), packet),
            Verdict::Drop => {
                trace!(dst = %packet.dst_addr(), "not for us and not forwarding");
                metrics.packets_dropped.inc();
            }
        }
    }

    pub fn send_packet(&self, packet: Ipv6Packet) -> bool {
        let dst = packet.dst_addr();
        if self.core.has_unicast_address(dst) {
            self.core.send_loopback(packet.into_bytes(), dst);
            true
        } else if dst.is_multicast() {
            self.core.send_all(packet.into_bytes(), dst);
            true
        } else {
            self.core.send_routed(packet.into_bytes(), dst)
        }
    }

    fn process_local(&self, iface: &InterfaceRef<Ipv6Addr>, mut packet: Ipv6Packet) {
        // Hosts ignore routing headers and take the payload. A forwarding
        // node acts as a segment endpoint until no segments are left.
        if let Some(rh) = packet.routing_header().filter(|_| self.core.forwarding()) {
            let segments_left = rh.segments_left();
            if !rh.is_srh() {
                trace!(routing_type = rh.routing_type(), "routing header not processed");
                self.core.metrics().packets_dropped.inc();
                return;
            }
            if segments_left == 0 {
                trace!("end of segments");
                self.deliver(iface, packet);
                return;
            }

            let left = segments_left - 1;
            let cleanup = rh.cleanup();
            let Some(next) = rh.segment(left as usize) else {
                debug!(segments_left, "segment list shorter than segments left");
                self.core.metrics().packets_dropped.inc();
                return;
            };

            packet.set_segments_left(left);
            packet.set_dst_addr(next);
            if left == 0 && cleanup {
                packet.remove_ext_header(ext::ROUTING);
            }
            trace!(next = %next, segments_left = left, "srh endpoint");

            if self.core.has_address(next) {
                self.process_local(iface, packet);
            } else {
                let policy = self.policy();
                self.forward(policy.as_ref(), packet);
            }
            return;
        }

        self.deliver(iface, packet);
    }

    /// Echo handling or listener dispatch for a packet addressed to us.
    fn deliver(&self, iface: &InterfaceRef<Ipv6Addr>, packet: Ipv6Packet) {
        self.core.metrics().packets_delivered.inc();
        let protocol = packet.upper_protocol();

        if protocol == Protocol::Icmpv6 as u8 {
            match Icmpv6Packet::parse(packet.upper_payload()) {
                Ok(msg) if msg.is_echo_request() => {
                    self.answer_echo(iface, &packet);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(src = %packet.src_addr(), error = %e, "dropping malformed icmpv6");
                    return;
                }
            }
        }

        match self.handlers.get(protocol) {
            Some(handler) => handler.on_packet(iface, &packet),
            None => {
                trace!(protocol, src = %packet.src_addr(), "no listener");
                let unicast = self.core.has_unicast_address(packet.dst_addr());
                if protocol != Protocol::Icmpv6 as u8
                    && unicast
                    && self.send_icmp_dest_unreachable.load(Ordering::Relaxed)
                {
                    self.send_icmp_error(
                        IcmpErrorKind::DestinationUnreachable,
                        dest_unreachable::ADDRESS_UNREACHABLE,
                        &packet,
                    );
                }
            }
        }
    }

    fn answer_echo(&self, iface: &InterfaceRef<Ipv6Addr>, request: &Ipv6Packet) {
        let dst = request.dst_addr();
        let src = if self.core.has_unicast_address(dst) {
            dst
        } else {
            match iface.addresses().into_iter().find(IfAddr::is_unicast) {
                Some(a) => a.addr,
                None => {
                    debug!(iface = %iface.name(), "no unicast address to answer echo from");
                    return;
                }
            }
        };

        let reply = match icmpv6::build_echo_reply(request.upper_payload()) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "dropping malformed echo request");
                return;
            }
        };

        let bytes = icmpv6::encapsulate(src, request.src_addr(), DEFAULT_HOP_LIMIT, reply);
        match Ipv6Packet::from_bytes(&bytes) {
            Ok(packet) => {
                self.core.metrics().icmp_echo_replies.inc();
                self.send_packet(packet);
            }
            Err(e) => debug!(error = %e, "failed to build echo reply"),
        }
    }

    fn forward(&self, policy: &dyn ForwardingPolicy<Ipv6Packet>, mut packet: Ipv6Packet) {
        let metrics = self.core.metrics();
        let dst = packet.dst_addr();
        if dst.is_multicast() {
            trace!(dst = %dst, "not forwarding multicast");
            metrics.packets_dropped.inc();
            return;
        }

        if packet.hop_limit() <= 1 {
            debug!(src = %packet.src_addr(), dst = %dst, "hop limit exceeded");
            metrics.ttl_expired.inc();
            metrics.packets_dropped.inc();
            self.send_icmp_error(
                IcmpErrorKind::TimeExceeded,
                time_exceeded::HOP_LIMIT_EXCEEDED,
                &packet,
            );
            return;
        }

        packet.decrement_hop_limit();
        if !policy.on_forward(&self.core, &mut packet) {
            metrics.packets_dropped.inc();
            return;
        }

        let dst = packet.dst_addr();
        if self.core.send_routed(packet.into_bytes(), dst) {
            metrics.packets_forwarded.inc();
        }
    }

    fn send_icmp_error(&self, kind: IcmpErrorKind, code: u8, offending: &Ipv6Packet) {
        if !self.policy().allow_icmp_error(kind, offending) {
            return;
        }
        let Some(src) = self.core.source_address(offending.src_addr()) else {
            debug!(dst = %offending.src_addr(), "no source address for icmpv6 error");
            return;
        };

        let metrics = self.core.metrics();
        let msg_type = match kind {
            IcmpErrorKind::TimeExceeded => {
                metrics.icmp_time_exceeded_sent.inc();
                Icmpv6Type::TimeExceeded
            }
            IcmpErrorKind::DestinationUnreachable => {
                metrics.icmp_dest_unreachable_sent.inc();
                Icmpv6Type::DestinationUnreachable
            }
        };
        let message = icmpv6::build_error(msg_type, code, offending.as_bytes());
        let bytes = icmpv6::encapsulate(src, offending.src_addr(), DEFAULT_HOP_LIMIT, message);
        match Ipv6Packet::from_bytes(&bytes) {
            Ok(packet) => {
                self.send_packet(packet);
            }
            Err(e) => debug!(error = %e, "failed to build icmpv6 error"),
        }
    }

    pub fn close(&self) {
        self.core.close(&self.listener());
        self.handlers.clear();
    }
}

impl InterfaceListener<Ipv6Addr> for Ipv6Node {
    fn on_incoming_packet(&self, iface: &InterfaceRef<Ipv6Addr>, packet: &[u8]) {
        self.receive(iface, packet);
    }
}
