//! IPv4 node
//!
//! Adds IPv4 specifics on top of `NodeCore`: directed and limited broadcast,
//! echo replies, Time Exceeded and Protocol Unreachable.

use super::interface::{same_interface, IfAddr, InterfaceListener, InterfaceRef};
use super::node::{NodeConfig, NodeCore, PacketHandler, ProtocolHandlers};
use super::policy::{DefaultPolicy, ForwardingPolicy, IcmpErrorKind, Verdict};
use super::routing::{Destination, Route, RouteSource, RoutingTable};
use super::{read, write};
use crate::protocol::icmp::{self, dest_unreachable, time_exceeded, IcmpPacket};
use crate::protocol::ipv4::{Ipv4Builder, Ipv4Packet, Protocol, DEFAULT_TTL};
use crate::telemetry::MetricsRegistry;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, RwLock, Weak};
use tracing::{debug, info, trace};

/// All-hosts group joined by every interface
pub const ALL_HOSTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

pub struct Ipv4Node {
    core: NodeCore<Ipv4Addr>,
    policy: RwLock<Arc<dyn ForwardingPolicy<Ipv4Packet>>>,
    handlers: ProtocolHandlers<Ipv4Packet>,
    send_icmp_dest_unreachable: AtomicBool,
    discard_broadcast_echo_requests: AtomicBool,
    self_ref: Weak<Ipv4Node>,
}

impl Ipv4Node {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        Self::with_metrics(config, Arc::new(MetricsRegistry::new()))
    }

    pub fn with_metrics(config: NodeConfig, metrics: Arc<MetricsRegistry>) -> Arc<Self> {
        let node = Arc::new_cyclic(|self_ref| Self {
            core: NodeCore::new(config.forwarding, metrics),
            policy: RwLock::new(Arc::new(DefaultPolicy)),
            handlers: ProtocolHandlers::default(),
            send_icmp_dest_unreachable: AtomicBool::new(config.send_icmp_dest_unreachable),
            discard_broadcast_echo_requests: AtomicBool::new(config.discard_broadcast_echo_requests),
            self_ref: self_ref.clone(),
        });
        node.core.loopback().add_listener(node.listener());
        node
    }

    fn listener(&self) -> Weak<dyn InterfaceListener<Ipv4Addr>> {
        self.self_ref.clone()
    }

    pub fn core(&self) -> &NodeCore<Ipv4Addr> {
        &self.core
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.core.metrics()
    }

    pub fn policy(&self) -> Arc<dyn ForwardingPolicy<Ipv4Packet>> {
        read(&self.policy).clone()
    }

    pub fn set_policy(&self, policy: Arc<dyn ForwardingPolicy<Ipv4Packet>>) {
        *write(&self.policy) = policy;
    }

    pub fn set_listener(&self, protocol: u8, handler: Arc<dyn PacketHandler<Ipv4Packet>>) {
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

    pub fn set_discard_broadcast_echo_requests(&self, enabled: bool) {
        self.discard_broadcast_echo_requests
            .store(enabled, Ordering::Relaxed);
    }

    pub fn routing_table(&self) -> MutexGuard<'_, RoutingTable<Ipv4Addr>> {
        self.core.routing_table()
    }

    pub fn interfaces(&self) -> Vec<InterfaceRef<Ipv4Addr>> {
        self.core.interfaces()
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.core.address()
    }

    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.core.addresses()
    }

    pub fn has_address(&self, addr: Ipv4Addr) -> bool {
        self.core.has_address(addr)
    }

    pub fn source_address(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        self.core.source_address(dst)
    }

    /// Attach an interface. Addresses it already carries get their
    /// connected routes and broadcast addresses.
    pub fn add_interface(&self, iface: InterfaceRef<Ipv4Addr>) {
        self.core.attach(iface.clone(), &self.listener());
        for addr in iface.addresses().into_iter().filter(IfAddr::is_unicast) {
            self.install_address(&iface, addr);
        }
        info!(iface = %iface.name(), "ipv4 interface added");
    }

    pub fn remove_interface(&self, iface: &InterfaceRef<Ipv4Addr>) -> bool {
        self.core.detach(iface, &self.listener())
    }

    /// Configure an address on `iface`.
    pub fn add_address(&self, iface: &InterfaceRef<Ipv4Addr>, addr: IfAddr<Ipv4Addr>) {
        iface.add_address(addr);
        if addr.is_unicast() {
            self.install_address(iface, addr);
        }
        info!(iface = %iface.name(), addr = %addr, "ipv4 address added");
    }

    fn install_address(&self, iface: &InterfaceRef<Ipv4Addr>, addr: IfAddr<Ipv4Addr>) {
        if let Some(prefix) = addr.prefix() {
            if prefix.len() < 32 {
                iface.add_address(IfAddr::broadcast(prefix.directed_broadcast()));
            }
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
        iface.add_address(IfAddr::broadcast(Ipv4Addr::BROADCAST));
        iface.add_address(IfAddr::multicast(ALL_HOSTS));
    }

    /// Remove an address; its connected route and directed broadcast go
    /// with it once no other address on the interface shares the prefix.
    pub fn remove_address(&self, iface: &InterfaceRef<Ipv4Addr>, addr: Ipv4Addr) -> bool {
        let Some(entry) = iface.addresses().into_iter().find(|a| a.addr == addr) else {
            return false;
        };
        iface.remove_address(addr);

        if let Some(prefix) = entry.prefix() {
            let shared = iface.addresses().iter().any(|a| a.prefix() == Some(prefix));
            if !shared {
                if prefix.len() < 32 {
                    iface.remove_address(prefix.directed_broadcast());
                }
                let mut routing = self.core.routing_table();
                routing.retain(|r| {
                    !(r.source == RouteSource::Connected
                        && r.destination == Destination::Prefix(prefix)
                        && same_interface(&r.interface, iface))
                });
                self.core.metrics().set_route_count(routing.len());
            }
        }
        info!(iface = %iface.name(), addr = %addr, "ipv4 address removed");
        true
    }

    /// Entry point for packets arriving on any attached interface.
    pub fn receive(&self, iface: &InterfaceRef<Ipv4Addr>, data: &[u8]) {
        let metrics = self.core.metrics();
        metrics.record_rx(&iface.name(), data.len());

        let packet = match Ipv4Packet::from_bytes(data) {
            Ok(p) => p,
            Err(e) => {
                debug!(iface = %iface.name(), error = %e, "dropping malformed ipv4 packet");
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

    /// Originate a packet: owned destinations loop back, group destinations
    /// go out every interface, the rest is routed.
    pub fn send_packet(&self, packet: Ipv4Packet) -> bool {
        let dst = packet.dst_addr();
        if self.core.has_unicast_address(dst) {
            self.core.send_loopback(packet.into_bytes(), dst);
            true
        } else if dst.is_multicast() || dst.is_broadcast() {
            self.core.send_all(packet.into_bytes(), dst);
            true
        } else {
            self.core.send_routed(packet.into_bytes(), dst)
        }
    }

    fn process_local(&self, iface: &InterfaceRef<Ipv4Addr>, packet: Ipv4Packet) {
        self.core.metrics().packets_delivered.inc();
        let protocol = packet.protocol();

        if protocol == Protocol::Icmp as u8 {
            match IcmpPacket::parse(packet.payload()) {
                Ok(icmp) if icmp.is_echo_request() => {
                    self.answer_echo(iface, &packet);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(src = %packet.src_addr(), error = %e, "dropping malformed icmp");
                    return;
                }
            }
        }

        match self.handlers.get(protocol) {
            Some(handler) => handler.on_packet(iface, &packet),
            None => {
                trace!(protocol, src = %packet.src_addr(), "no listener");
                let unicast = self.core.has_unicast_address(packet.dst_addr());
                if protocol != Protocol::Icmp as u8
                    && unicast
                    && self.send_icmp_dest_unreachable.load(Ordering::Relaxed)
                {
                    self.send_icmp_error(
                        IcmpErrorKind::DestinationUnreachable,
                        dest_unreachable::PROTOCOL_UNREACHABLE,
                        &packet,
                    );
                }
            }
        }
    }

    fn answer_echo(&self, iface: &InterfaceRef<Ipv4Addr>, request: &Ipv4Packet) {
        let dst = request.dst_addr();
        let src = if self.core.has_unicast_address(dst) {
            dst
        } else if self.discard_broadcast_echo_requests.load(Ordering::Relaxed) {
            debug!(dst = %dst, "ignoring broadcast echo request");
            return;
        } else {
            match iface.addresses().into_iter().find(IfAddr::is_unicast) {
                Some(a) => a.addr,
                None => {
                    debug!(iface = %iface.name(), "no unicast address to answer echo from");
                    return;
                }
            }
        };

        let reply = match icmp::build_echo_reply(request.payload()) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "dropping malformed echo request");
                return;
            }
        };

        let packet = Ipv4Builder::new()
            .protocol(Protocol::Icmp as u8)
            .ttl(DEFAULT_TTL)
            .src_addr(src)
            .dst_addr(request.src_addr())
            .payload(&reply)
            .build_packet();
        trace!(src = %src, dst = %request.src_addr(), "echo reply");
        self.core.metrics().icmp_echo_replies.inc();
        self.send_packet(packet);
    }

    fn forward(&self, policy: &dyn ForwardingPolicy<Ipv4Packet>, mut packet: Ipv4Packet) {
        let metrics = self.core.metrics();
        let dst = packet.dst_addr();
        if dst.is_multicast() || dst.is_broadcast() {
            trace!(dst = %dst, "not forwarding group packet");
            metrics.packets_dropped.inc();
            return;
        }

        if packet.ttl() <= 1 {
            debug!(src = %packet.src_addr(), dst = %dst, "ttl expired");
            metrics.ttl_expired.inc();
            metrics.packets_dropped.inc();
            self.send_icmp_error(
                IcmpErrorKind::TimeExceeded,
                time_exceeded::TTL_EXCEEDED,
                &packet,
            );
            return;
        }

        packet.decrement_ttl();
        if !policy.on_forward(&self.core, &mut packet) {
            metrics.packets_dropped.inc();
            return;
        }

        let dst = packet.dst_addr();
        if self.core.send_routed(packet.into_bytes(), dst) {
            metrics.packets_forwarded.inc();
        }
    }

    fn send_icmp_error(&self, kind: IcmpErrorKind, code: u8, offending: &Ipv4Packet) {
        if !self.policy().allow_icmp_error(kind, offending) {
            return;
        }
        let Some(src) = self.core.source_address(offending.src_addr()) else {
            debug!(dst = %offending.src_addr(), "no source address for icmp error");
            return;
        };

        let metrics = self.core.metrics();
        let message = match kind {
            IcmpErrorKind::TimeExceeded => {
                metrics.icmp_time_exceeded_sent.inc();
                icmp::build_time_exceeded(code, offending.header(), offending.payload())
            }
            IcmpErrorKind::DestinationUnreachable => {
                metrics.icmp_dest_unreachable_sent.inc();
                icmp::build_destination_unreachable(code, offending.header(), offending.payload())
            }
        };

        let packet = Ipv4Builder::new()
            .protocol(Protocol::Icmp as u8)
            .ttl(DEFAULT_TTL)
            .src_addr(src)
            .dst_addr(offending.src_addr())
            .payload(&message)
            .build_packet();
        self.send_packet(packet);
    }

    /// Detach and close every interface.
    pub fn close(&self) {
        self.core.close(&self.listener());
        self.handlers.clear();
    }
}

impl InterfaceListener<Ipv4Addr> for Ipv4Node {
    fn on_incoming_packet(&self, iface: &InterfaceRef<Ipv4Addr>, packet: &[u8]) {
        self.receive(iface, packet);
    }
}
