//! Family-independent node state
//!
//! `NodeCore` owns what every IP node has regardless of family: the
//! attached interfaces, the routing table, the forwarding flag and the
//! implicit loopback interface. The IPv4 and IPv6 nodes wrap it and add
//! their own local delivery and ICMP handling.

use super::interface::{same_interface, InterfaceListener, InterfaceRef, LoopbackInterface, NetInterface};
use super::routing::{Route, RoutingTable};
use super::{lock, read, write};
use crate::protocol::{IpAddress, IpPacket};
use crate::telemetry::MetricsRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, trace};

/// Behavior flags shared by both node families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    pub forwarding: bool,
    /// Answer undeliverable local packets with Destination Unreachable
    pub send_icmp_dest_unreachable: bool,
    /// Ignore echo requests sent to broadcast or multicast addresses
    pub discard_broadcast_echo_requests: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            forwarding: false,
            send_icmp_dest_unreachable: true,
            discard_broadcast_echo_requests: false,
        }
    }
}

impl NodeConfig {
    pub fn router() -> Self {
        Self {
            forwarding: true,
            ..Self::default()
        }
    }
}

/// Receives locally delivered packets of one upper-layer protocol.
pub trait PacketHandler<P: IpPacket>: Send + Sync {
    fn on_packet(&self, iface: &InterfaceRef<P::Addr>, packet: &P);
}

impl<P, F> PacketHandler<P> for F
where
    P: IpPacket,
    F: Fn(&InterfaceRef<P::Addr>, &P) + Send + Sync,
{
    fn on_packet(&self, iface: &InterfaceRef<P::Addr>, packet: &P) {
        self(iface, packet)
    }
}

/// Upper-layer handlers keyed by protocol number
pub struct ProtocolHandlers<P: IpPacket> {
    handlers: RwLock<HashMap<u8, Arc<dyn PacketHandler<P>>>>,
}

impl<P: IpPacket> Default for ProtocolHandlers<P> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }
}

impl<P: IpPacket> ProtocolHandlers<P> {
    /// Install `handler` for `protocol`, replacing any previous one.
    pub fn set(&self, protocol: u8, handler: Arc<dyn PacketHandler<P>>) {
        write(&self.handlers).insert(protocol, handler);
    }

    pub fn remove(&self, protocol: u8) -> bool {
        write(&self.handlers).remove(&protocol).is_some()
    }

    pub fn get(&self, protocol: u8) -> Option<Arc<dyn PacketHandler<P>>> {
        read(&self.handlers).get(&protocol).cloned()
    }

    pub fn clear(&self) {
        write(&self.handlers).clear();
    }
}

/// Interfaces, routes and the forwarding flag of a node.
///
/// No lock is held while a packet is handed to an interface, so an
/// interface may deliver synchronously back into the node.
pub struct NodeCore<A: IpAddress> {
    interfaces: RwLock<Vec<InterfaceRef<A>>>,
    routing: Mutex<RoutingTable<A>>,
    forwarding: AtomicBool,
    loopback: Arc<LoopbackInterface<A>>,
    metrics: Arc<MetricsRegistry>,
}

impl<A: IpAddress> NodeCore<A> {
    pub fn new(forwarding: bool, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            interfaces: RwLock::new(Vec::new()),
            routing: Mutex::new(RoutingTable::new()),
            forwarding: AtomicBool::new(forwarding),
            loopback: LoopbackInterface::new(),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn loopback(&self) -> InterfaceRef<A> {
        self.loopback.clone()
    }

    pub fn forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Relaxed)
    }

    pub fn set_forwarding(&self, enabled: bool) {
        self.forwarding.store(enabled, Ordering::Relaxed);
    }

    /// Attach an interface and register `listener` on it.
    pub fn attach(&self, iface: InterfaceRef<A>, listener: &Weak<dyn InterfaceListener<A>>) {
        iface.add_listener(listener.clone());
        write(&self.interfaces).push(iface);
        self.rename_interfaces();
    }

    /// Detach an interface, dropping every route through it.
    pub fn detach(&self, iface: &InterfaceRef<A>, listener: &Weak<dyn InterfaceListener<A>>) -> bool {
        let removed = {
            let mut interfaces = write(&self.interfaces);
            match interfaces.iter().position(|i| same_interface(i, iface)) {
                Some(pos) => {
                    interfaces.remove(pos);
                    true
                }
                None => false,
            }
        };
        if !removed {
            return false;
        }

        iface.remove_listener(listener);
        let dropped = {
            let mut routing = lock(&self.routing);
            let dropped = routing.remove_interface(iface);
            self.metrics.set_route_count(routing.len());
            dropped
        };
        debug!(iface = %iface.name(), routes = dropped, "interface detached");
        self.rename_interfaces();
        true
    }

    fn rename_interfaces(&self) {
        for (i, iface) in read(&self.interfaces).iter().enumerate() {
            let name = format!("ni{}", i);
            iface.set_name(&name);
            self.metrics.register_interface(&name);
        }
    }

    pub fn interfaces(&self) -> Vec<InterfaceRef<A>> {
        read(&self.interfaces).clone()
    }

    pub fn interface(&self, name: &str) -> Option<InterfaceRef<A>> {
        read(&self.interfaces)
            .iter()
            .find(|i| i.name() == name)
            .cloned()
    }

    pub fn routing_table(&self) -> MutexGuard<'_, RoutingTable<A>> {
        lock(&self.routing)
    }

    /// Snapshot of the route chosen for `dst`.
    pub fn get_route(&self, dst: A) -> Option<Route<A>> {
        lock(&self.routing).get_route(dst).cloned()
    }

    /// Whether `addr` belongs to this node, including group addresses and
    /// the loopback prefix.
    pub fn has_address(&self, addr: A) -> bool {
        self.loopback.has_address(addr) || read(&self.interfaces).iter().any(|i| i.has_address(addr))
    }

    pub fn has_unicast_address(&self, addr: A) -> bool {
        if A::loopback_prefix().contains(addr) {
            return true;
        }
        read(&self.interfaces)
            .iter()
            .any(|i| i.addresses().iter().any(|a| a.addr == addr && a.is_unicast()))
    }

    /// First address of the first interface
    pub fn address(&self) -> Option<A> {
        let interfaces = read(&self.interfaces);
        interfaces.first()?.addresses().first().map(|a| a.addr)
    }

    /// All interface addresses without duplicates, in interface order.
    pub fn addresses(&self) -> Vec<A> {
        let mut result: Vec<A> = Vec::new();
        for iface in read(&self.interfaces).iter() {
            for a in iface.addresses() {
                if !result.contains(&a.addr) {
                    result.push(a.addr);
                }
            }
        }
        result
    }

    /// Source address for a packet originated toward `dst`.
    ///
    /// Loopback destinations use the loopback address and multicast ones the
    /// node address. Otherwise the route's interface supplies the unicast
    /// address whose prefix contains the next hop.
    pub fn source_address(&self, dst: A) -> Option<A> {
        if A::loopback_prefix().contains(dst) {
            return Some(A::LOOPBACK);
        }
        if dst.is_multicast() {
            return self.address();
        }

        let route = self.get_route(dst)?;
        let target = route.next_hop_for(dst);
        let addresses = route.interface.addresses();
        addresses
            .iter()
            .find(|a| a.is_unicast() && a.prefix().is_some_and(|p| p.contains(target) || p.contains(dst)))
            .or_else(|| addresses.iter().find(|a| a.is_unicast()))
            .map(|a| a.addr)
    }

    /// Send through the route for `dst`. Returns false when there is none.
    pub fn send_routed(&self, packet: Vec<u8>, dst: A) -> bool {
        let Some(route) = self.get_route(dst) else {
            debug!(dst = %dst, family = A::FAMILY, "no route, dropping");
            self.metrics.no_route.inc();
            self.metrics.packets_dropped.inc();
            return false;
        };

        let next_hop = route.next_hop_for(dst);
        let name = route.interface.name();
        trace!(dst = %dst, next_hop = %next_hop, iface = %name, len = packet.len(), "send");
        self.metrics.record_tx(&name, packet.len());
        route.interface.send(packet, next_hop);
        true
    }

    /// Send a copy on every attached interface.
    pub fn send_all(&self, packet: Vec<u8>, dst: A) {
        for iface in self.interfaces() {
            self.metrics.record_tx(&iface.name(), packet.len());
            iface.send(packet.clone(), dst);
        }
    }

    pub fn send_loopback(&self, packet: Vec<u8>, dst: A) {
        trace!(dst = %dst, len = packet.len(), "loopback");
        self.loopback.send(packet, dst);
    }

    /// Detach every interface and close it.
    pub fn close(&self, listener: &Weak<dyn InterfaceListener<A>>) {
        let interfaces = std::mem::take(&mut *write(&self.interfaces));
        for iface in &interfaces {
            iface.remove_listener(listener);
            iface.close();
        }
        self.loopback.remove_listener(listener);
        lock(&self.routing).clear();
        self.metrics.set_route_count(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::interface::IfAddr;
    use crate::dataplane::link::{IpLink, IpLinkInterface};
    use crate::dataplane::routing::Destination;
    use std::net::Ipv4Addr;

    struct Sink;

    impl InterfaceListener<Ipv4Addr> for Sink {
        fn on_incoming_packet(&self, _iface: &InterfaceRef<Ipv4Addr>, _packet: &[u8]) {}
    }

    fn core() -> NodeCore<Ipv4Addr> {
        NodeCore::new(false, Arc::new(MetricsRegistry::new()))
    }

    #[test]
    fn test_interfaces_renamed_on_change() {
        let core = core();
        let sink: Arc<dyn InterfaceListener<Ipv4Addr>> = Arc::new(Sink);
        let listener = Arc::downgrade(&sink);
        let link = IpLink::new("10.0.0.0/24".parse().unwrap());
        let a: InterfaceRef<Ipv4Addr> = IpLinkInterface::new(&link);
        let b: InterfaceRef<Ipv4Addr> = IpLinkInterface::new(&link);

        core.attach(a.clone(), &listener);
        core.attach(b.clone(), &listener);
        assert_eq!(a.name(), "ni0");
        assert_eq!(b.name(), "ni1");

        core.routing_table().add(Route::connected("10.0.0.0/24".parse().unwrap(), a.clone()));
        assert!(core.detach(&a, &listener));
        assert!(!core.detach(&a, &listener));
        assert_eq!(b.name(), "ni0");
        assert!(core.routing_table().is_empty());
        assert!(core.interface("ni0").is_some());
        assert!(core.interface("ni1").is_none());
    }

    #[test]
    fn test_addresses_and_ownership() {
        let core = core();
        let sink: Arc<dyn InterfaceListener<Ipv4Addr>> = Arc::new(Sink);
        let link = IpLink::new("10.0.0.0/24".parse().unwrap());
        let a: InterfaceRef<Ipv4Addr> = IpLinkInterface::new(&link);
        a.add_address(IfAddr::broadcast(Ipv4Addr::BROADCAST));
        let b: InterfaceRef<Ipv4Addr> = IpLinkInterface::with_address(&link, Some(IfAddr::unicast(Ipv4Addr::new(10, 0, 0, 1), 24)));
        core.attach(a, &Arc::downgrade(&sink));
        core.attach(b, &Arc::downgrade(&sink));

        assert_eq!(core.address(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            core.addresses(),
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::BROADCAST]
        );
        assert!(core.has_address(Ipv4Addr::BROADCAST));
        assert!(!core.has_unicast_address(Ipv4Addr::BROADCAST));
        assert!(core.has_unicast_address(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(core.has_address(Ipv4Addr::new(127, 1, 2, 3)));
    }

    #[test]
    fn test_source_address() {
        let core = core();
        let sink: Arc<dyn InterfaceListener<Ipv4Addr>> = Arc::new(Sink);
        let link = IpLink::new("10.0.0.0/24".parse().unwrap());
        let a: InterfaceRef<Ipv4Addr> = IpLinkInterface::new(&link);
        core.attach(a.clone(), &Arc::downgrade(&sink));
        {
            let mut rt = core.routing_table();
            rt.add(Route::connected("10.0.0.0/24".parse().unwrap(), a.clone()));
            rt.add(Route::new(
                "0.0.0.0/0".parse::<Destination<Ipv4Addr>>().unwrap(),
                Some(Ipv4Addr::new(10, 0, 0, 254)),
                a.clone(),
            ));
        }

        assert_eq!(core.source_address(Ipv4Addr::new(127, 0, 0, 5)), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(core.source_address(Ipv4Addr::new(224, 0, 0, 9)), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(core.source_address(Ipv4Addr::new(10, 0, 0, 7)), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(core.source_address(Ipv4Addr::new(8, 8, 8, 8)), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_send_routed_without_route() {
        let core = core();
        assert!(!core.send_routed(vec![0u8; 20], Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(core.metrics().no_route.get(), 1);
    }

    #[test]
    fn test_protocol_handlers() {
        use crate::protocol::ipv4::Ipv4Packet;

        let handlers: ProtocolHandlers<Ipv4Packet> = ProtocolHandlers::default();
        handlers.set(17, Arc::new(|_: &InterfaceRef<Ipv4Addr>, _: &Ipv4Packet| {}));
        assert!(handlers.get(17).is_some());
        assert!(handlers.get(6).is_none());
        assert!(handlers.remove(17));
        assert!(!handlers.remove(17));
    }
}
