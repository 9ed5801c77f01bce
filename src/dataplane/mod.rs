//! Data plane components
//!
//! Nodes, routing, NAT and link-address resolution. Interfaces feed packets
//! to nodes through listeners; nodes hand packets back to interfaces with a
//! next hop.

mod arp;
mod eth_interface;
mod interface;
mod ipv4_node;
mod ipv6_node;
mod link;
mod nat;
mod nat_table;
mod ndp;
mod node;
mod policy;
mod resolver;
mod routing;

pub use arp::{handle_arp, ArpServer, ArpSolicitor};
pub use eth_interface::{EthConfig, EthInterface, Ipv4EthInterface, Ipv6EthInterface, LinkFamily};
pub use interface::{
    same_interface, AddrKind, IfAddr, InterfaceListener, InterfaceRef, InterfaceState,
    ListenerSet, LoopbackInterface, NetInterface,
};
pub use ipv4_node::Ipv4Node;
pub use ipv6_node::Ipv6Node;
pub use link::{IpLink, IpLinkInterface};
pub use nat::{NatConfig, NatPolicy, NatResult};
pub use nat_table::{NatEntry, NatProtocol, NatTable, PortPool};
pub use ndp::{handle_ndp, NdServer, NdSolicitor};
pub use node::{NodeConfig, NodeCore, PacketHandler, ProtocolHandlers};
pub use policy::{DefaultPolicy, ForwardingPolicy, IcmpErrorKind, Verdict};
pub use resolver::{ResolutionCache, ResolverClient, ResolverConfig, Solicitor};
pub use routing::{Destination, Route, RouteSource, RoutingTable};

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panic while holding one of these locks leaves plain data behind, never a
// half-applied invariant, so poisoning is ignored.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
