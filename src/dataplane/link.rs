//! In-process IP link
//!
//! An `IpLink` joins any number of `IpLinkInterface`s without a link layer:
//! a packet sent toward a next hop reaches the interfaces that own that
//! address (all of them for group addresses). Delivery is synchronous, so a
//! small topology can be driven deterministically from a test.

use super::interface::{IfAddr, InterfaceListener, InterfaceRef, InterfaceState, ListenerSet, NetInterface};
use super::{lock, read, write};
use crate::protocol::{IpAddress, Prefix};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::trace;

/// Shared medium with an address pool and a router list.
pub struct IpLink<A: IpAddress> {
    prefix: Prefix<A>,
    next_host: Mutex<u128>,
    interfaces: RwLock<Vec<Weak<IpLinkInterface<A>>>>,
    routers: Mutex<Vec<A>>,
}

impl<A: IpAddress> IpLink<A> {
    pub fn new(prefix: Prefix<A>) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            next_host: Mutex::new(1),
            interfaces: RwLock::new(Vec::new()),
            routers: Mutex::new(Vec::new()),
        })
    }

    pub fn prefix(&self) -> Prefix<A> {
        self.prefix
    }

    /// Next unused host address of the link prefix, skipping the network
    /// address. Returns None once the prefix is exhausted.
    pub fn next_address(&self) -> Option<IfAddr<A>> {
        let mut next = lock(&self.next_host);
        let host_mask = self.prefix.host_mask().to_u128();
        // the all-ones host part is the IPv4 directed broadcast
        if *next >= host_mask {
            return None;
        }
        let addr = A::from_u128(self.prefix.addr().to_u128() | *next);
        *next += 1;
        Some(IfAddr::unicast(addr, self.prefix.len()))
    }

    pub fn add_router(&self, router: A) {
        lock(&self.routers).push(router);
    }

    pub fn remove_router(&self, router: A) {
        lock(&self.routers).retain(|r| *r != router);
    }

    pub fn routers(&self) -> Vec<A> {
        lock(&self.routers).clone()
    }

    /// Number of live interfaces attached to the link
    pub fn interface_count(&self) -> usize {
        read(&self.interfaces)
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn attach(&self, iface: Weak<IpLinkInterface<A>>) {
        let mut interfaces = write(&self.interfaces);
        interfaces.retain(|w| w.strong_count() > 0);
        interfaces.push(iface);
    }

    fn transmit(&self, sender: &IpLinkInterface<A>, packet: &[u8], next_hop: A) {
        let peers: Vec<Arc<IpLinkInterface<A>>> = read(&self.interfaces)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|peer| !std::ptr::eq(Arc::as_ptr(peer), sender))
            .collect();

        for peer in peers {
            peer.receive(packet, next_hop);
        }
    }
}

/// Interface attached to an `IpLink`
pub struct IpLinkInterface<A: IpAddress> {
    state: InterfaceState<A>,
    listeners: ListenerSet<A>,
    link: Arc<IpLink<A>>,
    running: AtomicBool,
    self_ref: Weak<IpLinkInterface<A>>,
}

impl<A: IpAddress> IpLinkInterface<A> {
    /// Attach a new interface using the next address of the link pool.
    pub fn new(link: &Arc<IpLink<A>>) -> Arc<Self> {
        Self::with_address(link, link.next_address())
    }

    pub fn with_address(link: &Arc<IpLink<A>>, addr: Option<IfAddr<A>>) -> Arc<Self> {
        let iface = Arc::new_cyclic(|self_ref| {
            let state = InterfaceState::new("link");
            if let Some(addr) = addr {
                state.add_address(addr);
            }
            Self {
                state,
                listeners: ListenerSet::default(),
                link: link.clone(),
                running: AtomicBool::new(true),
                self_ref: self_ref.clone(),
            }
        });
        link.attach(Arc::downgrade(&iface));
        iface
    }

    pub fn link(&self) -> &Arc<IpLink<A>> {
        &self.link
    }

    fn handle(&self) -> Option<InterfaceRef<A>> {
        self.self_ref.upgrade().map(|me| me as InterfaceRef<A>)
    }

    fn accepts(&self, next_hop: A) -> bool {
        next_hop.is_multicast() || next_hop.is_limited_broadcast() || self.state.has_address(next_hop)
    }

    fn receive(&self, packet: &[u8], next_hop: A) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let Some(me) = self.handle() else {
            return;
        };
        let accepted = self.accepts(next_hop);
        trace!(iface = %self.state.name(), next_hop = %next_hop, accepted, len = packet.len(), "link rx");
        self.listeners.deliver(&me, packet, accepted);
    }
}

impl<A: IpAddress> NetInterface<A> for IpLinkInterface<A> {
    fn name(&self) -> String {
        self.state.name()
    }

    fn set_name(&self, name: &str) {
        self.state.set_name(name);
    }

    fn addresses(&self) -> Vec<IfAddr<A>> {
        self.state.addresses()
    }

    fn add_address(&self, addr: IfAddr<A>) {
        self.state.add_address(addr);
    }

    fn remove_address(&self, addr: A) -> bool {
        self.state.remove_address(addr)
    }

    fn has_address(&self, addr: A) -> bool {
        self.state.has_address(addr)
    }

    fn send(&self, packet: Vec<u8>, next_hop: A) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        trace!(iface = %self.state.name(), next_hop = %next_hop, len = packet.len(), "link tx");
        if let Some(me) = self.handle() {
            // outgoing packets are visible to local promiscuous listeners too
            self.listeners.deliver(&me, &packet, false);
        }
        self.link.transmit(self, &packet, next_hop);
    }

    fn add_listener(&self, listener: Weak<dyn InterfaceListener<A>>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Weak<dyn InterfaceListener<A>>) {
        self.listeners.remove(listener);
    }

    fn add_promiscuous_listener(&self, listener: Weak<dyn InterfaceListener<A>>) {
        self.listeners.add_promiscuous(listener);
    }

    fn remove_promiscuous_listener(&self, listener: &Weak<dyn InterfaceListener<A>>) {
        self.listeners.remove_promiscuous(listener);
    }

    fn close(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.listeners.clear();
    }
}
