//! Network interface abstraction
//!
//! A node talks to the outside only through `NetInterface`: it hands a
//! packet and a next-hop address to `send`, and receives packets through
//! registered listeners. Listeners are held weakly so an interface never
//! keeps a node alive.

use super::{read, write};
use crate::protocol::{IpAddress, Prefix};
use crate::protocol::ip::parse_cidr;
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, Weak};

/// Shared handle to an interface of address family `A`.
pub type InterfaceRef<A> = Arc<dyn NetInterface<A>>;

/// Receives packets delivered by an interface.
pub trait InterfaceListener<A: IpAddress>: Send + Sync {
    fn on_incoming_packet(&self, iface: &InterfaceRef<A>, packet: &[u8]);
}

/// Link-facing side of the stack.
pub trait NetInterface<A: IpAddress>: Send + Sync {
    fn name(&self) -> String;

    fn set_name(&self, name: &str);

    fn addresses(&self) -> Vec<IfAddr<A>>;

    fn add_address(&self, addr: IfAddr<A>);

    /// Returns false if the address was not configured.
    fn remove_address(&self, addr: A) -> bool;

    fn has_address(&self, addr: A) -> bool {
        self.addresses().iter().any(|a| a.addr == addr)
    }

    /// Best-effort transmission toward `next_hop`; never blocks the caller.
    fn send(&self, packet: Vec<u8>, next_hop: A);

    fn add_listener(&self, listener: Weak<dyn InterfaceListener<A>>);

    fn remove_listener(&self, listener: &Weak<dyn InterfaceListener<A>>);

    /// Promiscuous listeners see every packet, owned destination or not.
    fn add_promiscuous_listener(&self, listener: Weak<dyn InterfaceListener<A>>);

    fn remove_promiscuous_listener(&self, listener: &Weak<dyn InterfaceListener<A>>);

    fn close(&self);
}

/// Role of an address configured on an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrKind {
    Unicast,
    Broadcast,
    Multicast,
}

/// Address configured on an interface, optionally with its on-link prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IfAddr<A> {
    pub addr: A,
    pub prefix_len: Option<u8>,
    pub kind: AddrKind,
}

impl<A: IpAddress> IfAddr<A> {
    pub fn unicast(addr: A, prefix_len: u8) -> Self {
        Self {
            addr,
            prefix_len: Some(prefix_len.min(A::BITS)),
            kind: AddrKind::Unicast,
        }
    }

    /// Unicast address without an on-link prefix
    pub fn host(addr: A) -> Self {
        Self {
            addr,
            prefix_len: None,
            kind: AddrKind::Unicast,
        }
    }

    pub fn broadcast(addr: A) -> Self {
        Self {
            addr,
            prefix_len: None,
            kind: AddrKind::Broadcast,
        }
    }

    pub fn multicast(addr: A) -> Self {
        Self {
            addr,
            prefix_len: None,
            kind: AddrKind::Multicast,
        }
    }

    /// On-link prefix containing this address
    pub fn prefix(&self) -> Option<Prefix<A>> {
        self.prefix_len.map(|len| Prefix::masked(self.addr, len))
    }

    pub fn is_unicast(&self) -> bool {
        self.kind == AddrKind::Unicast
    }
}

impl<A: IpAddress> fmt::Display for IfAddr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix_len {
            Some(len) => write!(f, "{}/{}", self.addr, len),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl<A: IpAddress> FromStr for IfAddr<A> {
    type Err = Error;

    /// "10.0.0.1/24" is a unicast address on 10.0.0.0/24; a multicast
    /// address is accepted without a prefix.
    fn from_str(s: &str) -> Result<Self> {
        let has_len = s.contains('/');
        let (addr, len) = parse_cidr::<A>(s)?;
        if addr.is_multicast() {
            return Ok(IfAddr::multicast(addr));
        }
        Ok(if has_len {
            IfAddr::unicast(addr, len)
        } else {
            IfAddr::host(addr)
        })
    }
}

/// Compare two interface handles by identity.
pub fn same_interface<A: IpAddress>(a: &InterfaceRef<A>, b: &InterfaceRef<A>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Listener registrations shared by the interface implementations.
pub struct ListenerSet<A: IpAddress> {
    normal: RwLock<Vec<Weak<dyn InterfaceListener<A>>>>,
    promiscuous: RwLock<Vec<Weak<dyn InterfaceListener<A>>>>,
}

impl<A: IpAddress> Default for ListenerSet<A> {
    fn default() -> Self {
        Self {
            normal: RwLock::new(Vec::new()),
            promiscuous: RwLock::new(Vec::new()),
        }
    }
}

impl<A: IpAddress> ListenerSet<A> {
    pub fn add(&self, listener: Weak<dyn InterfaceListener<A>>) {
        write(&self.normal).push(listener);
    }

    pub fn remove(&self, listener: &Weak<dyn InterfaceListener<A>>) {
        write(&self.normal).retain(|l| !Weak::ptr_eq(l, listener));
    }

    pub fn add_promiscuous(&self, listener: Weak<dyn InterfaceListener<A>>) {
        write(&self.promiscuous).push(listener);
    }

    pub fn remove_promiscuous(&self, listener: &Weak<dyn InterfaceListener<A>>) {
        write(&self.promiscuous).retain(|l| !Weak::ptr_eq(l, listener));
    }

    pub fn clear(&self) {
        write(&self.normal).clear();
        write(&self.promiscuous).clear();
    }

    /// Deliver to promiscuous listeners, and to normal listeners when
    /// `accepted` says the packet is for this interface.
    ///
    /// Listeners are upgraded before the call so no lock is held while they
    /// run; a listener may send on the same interface.
    pub fn deliver(&self, iface: &InterfaceRef<A>, packet: &[u8], accepted: bool) {
        let mut targets: Vec<Arc<dyn InterfaceListener<A>>> =
            read(&self.promiscuous).iter().filter_map(Weak::upgrade).collect();
        if accepted {
            targets.extend(read(&self.normal).iter().filter_map(Weak::upgrade));
        }
        for listener in targets {
            listener.on_incoming_packet(iface, packet);
        }
    }
}

/// Name and address state shared by the interface implementations.
pub struct InterfaceState<A: IpAddress> {
    name: RwLock<String>,
    addresses: RwLock<Vec<IfAddr<A>>>,
}

impl<A: IpAddress> InterfaceState<A> {
    pub fn new(name: &str) -> Self {
        Self {
            name: RwLock::new(name.to_string()),
            addresses: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> String {
        read(&self.name).clone()
    }

    pub fn set_name(&self, name: &str) {
        *write(&self.name) = name.to_string();
    }

    pub fn addresses(&self) -> Vec<IfAddr<A>> {
        read(&self.addresses).clone()
    }

    pub fn add_address(&self, addr: IfAddr<A>) {
        let mut addresses = write(&self.addresses);
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }

    pub fn remove_address(&self, addr: A) -> bool {
        let mut addresses = write(&self.addresses);
        let before = addresses.len();
        if let Some(pos) = addresses.iter().position(|a| a.addr == addr) {
            addresses.remove(pos);
        }
        addresses.len() != before
    }

    pub fn has_address(&self, addr: A) -> bool {
        read(&self.addresses).iter().any(|a| a.addr == addr)
    }

    pub fn clear(&self) {
        write(&self.addresses).clear();
    }
}

/// Implicit interface that hands sent packets straight back to its listeners.
pub struct LoopbackInterface<A: IpAddress> {
    state: InterfaceState<A>,
    listeners: ListenerSet<A>,
    self_ref: Weak<LoopbackInterface<A>>,
}

impl<A: IpAddress> LoopbackInterface<A> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| {
            let state = InterfaceState::new("lo");
            let prefix = A::loopback_prefix();
            state.add_address(IfAddr::unicast(A::LOOPBACK, prefix.len()));
            Self {
                state,
                listeners: ListenerSet::default(),
                self_ref: self_ref.clone(),
            }
        })
    }
}

impl<A: IpAddress> NetInterface<A> for LoopbackInterface<A> {
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
        A::loopback_prefix().contains(addr) || self.state.has_address(addr)
    }

    fn send(&self, packet: Vec<u8>, _next_hop: A) {
        if let Some(me) = self.self_ref.upgrade() {
            let iface: InterfaceRef<A> = me;
            self.listeners.deliver(&iface, &packet, true);
        }
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
        self.listeners.clear();
    }
}
