//! Routing table

use super::interface::{same_interface, InterfaceRef};
use crate::protocol::ip::parse_cidr;
use crate::protocol::{IpAddress, Prefix};
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Route destination: a network prefix or a single host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination<A> {
    Prefix(Prefix<A>),
    Host(A),
}

impl<A: IpAddress> Destination<A> {
    pub fn matches(&self, addr: A) -> bool {
        match self {
            Destination::Prefix(p) => p.contains(addr),
            Destination::Host(h) => *h == addr,
        }
    }

    /// Number of significant bits, used for longest prefix match.
    pub fn prefix_len(&self) -> u8 {
        match self {
            Destination::Prefix(p) => p.len(),
            Destination::Host(_) => A::BITS,
        }
    }
}

impl<A> From<Prefix<A>> for Destination<A> {
    fn from(prefix: Prefix<A>) -> Self {
        Destination::Prefix(prefix)
    }
}

impl<A: IpAddress> fmt::Display for Destination<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Prefix(p) => write!(f, "{}", p),
            Destination::Host(h) => write!(f, "{}", h),
        }
    }
}

impl<A: IpAddress> FromStr for Destination<A> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains('/') {
            let (addr, len) = parse_cidr::<A>(s)?;
            Ok(Destination::Prefix(Prefix::new(addr, len)?))
        } else {
            let (addr, _) = parse_cidr::<A>(s)?;
            Ok(Destination::Host(addr))
        }
    }
}

/// Source of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Installed when an address with a prefix is configured
    Connected,
    /// Added by the operator or from config
    Static,
}

/// Route entry
#[derive(Clone)]
pub struct Route<A: IpAddress> {
    pub destination: Destination<A>,
    /// Next hop (None for directly connected)
    pub next_hop: Option<A>,
    /// Outgoing interface
    pub interface: InterfaceRef<A>,
    pub source: RouteSource,
}

impl<A: IpAddress> Route<A> {
    pub fn new(destination: Destination<A>, next_hop: Option<A>, interface: InterfaceRef<A>) -> Self {
        Self {
            destination,
            next_hop,
            interface,
            source: RouteSource::Static,
        }
    }

    pub fn connected(prefix: Prefix<A>, interface: InterfaceRef<A>) -> Self {
        Self {
            destination: Destination::Prefix(prefix),
            next_hop: None,
            interface,
            source: RouteSource::Connected,
        }
    }

    /// Address the packet is handed to on the outgoing link.
    pub fn next_hop_for(&self, dst: A) -> A {
        self.next_hop.unwrap_or(dst)
    }
}

impl<A: IpAddress> fmt::Debug for Route<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("destination", &self.destination)
            .field("next_hop", &self.next_hop)
            .field("interface", &self.interface.name())
            .field("source", &self.source)
            .finish()
    }
}

impl<A: IpAddress> fmt::Display for Route<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(nh) = self.next_hop {
            write!(f, " via {}", nh)?;
        }
        write!(f, " dev {}", self.interface.name())
    }
}

/// Ordered route list with longest prefix match lookup.
///
/// Routes keep insertion order; among equal-length matches the earliest
/// route wins.
pub struct RoutingTable<A: IpAddress> {
    routes: Vec<Route<A>>,
}

impl<A: IpAddress> Default for RoutingTable<A> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<A: IpAddress> RoutingTable<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route
    pub fn add(&mut self, route: Route<A>) {
        self.routes.push(route);
    }

    /// Append a route whose interface is the one currently used to reach
    /// `next_hop`.
    pub fn add_via(&mut self, destination: Destination<A>, next_hop: A) -> Result<()> {
        let interface = self
            .get_route(next_hop)
            .map(|r| r.interface.clone())
            .ok_or_else(|| Error::Config(format!("next hop {} is not reachable", next_hop)))?;
        self.add(Route::new(destination, Some(next_hop), interface));
        Ok(())
    }

    /// Replace every route to `route.destination` with `route`.
    pub fn set(&mut self, route: Route<A>) {
        let destination = route.destination;
        self.routes.retain(|r| r.destination != destination);
        self.add(route);
    }

    /// Insert at `index` (clamped to the table length).
    pub fn insert(&mut self, index: usize, route: Route<A>) {
        let index = index.min(self.routes.len());
        self.routes.insert(index, route);
    }

    /// Remove the first route to `destination`.
    pub fn remove(&mut self, destination: &Destination<A>) -> Option<Route<A>> {
        let pos = self.routes.iter().position(|r| r.destination == *destination)?;
        Some(self.routes.remove(pos))
    }

    /// Remove the first route to `destination` through `next_hop`.
    pub fn remove_via(&mut self, destination: &Destination<A>, next_hop: A) -> Option<Route<A>> {
        let pos = self
            .routes
            .iter()
            .position(|r| r.destination == *destination && r.next_hop == Some(next_hop))?;
        Some(self.routes.remove(pos))
    }

    /// Remove every route to `destination`, returning how many were removed.
    pub fn remove_all(&mut self, destination: &Destination<A>) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| r.destination != *destination);
        before - self.routes.len()
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Route<A>> {
        if index < self.routes.len() {
            Some(self.routes.remove(index))
        } else {
            None
        }
    }

    /// Remove every route through `iface`.
    pub fn remove_interface(&mut self, iface: &InterfaceRef<A>) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| !same_interface(&r.interface, iface));
        before - self.routes.len()
    }

    pub fn retain<F: FnMut(&Route<A>) -> bool>(&mut self, f: F) {
        self.routes.retain(f);
    }

    pub fn get(&self, index: usize) -> Option<&Route<A>> {
        self.routes.get(index)
    }

    pub fn routes(&self) -> &[Route<A>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Longest prefix match. A host route for `addr` wins immediately.
    pub fn get_route(&self, addr: A) -> Option<&Route<A>> {
        let mut best: Option<&Route<A>> = None;

        for route in &self.routes {
            match route.destination {
                Destination::Host(h) if h == addr => return Some(route),
                Destination::Host(_) => {}
                Destination::Prefix(p) => {
                    if !p.contains(addr) {
                        continue;
                    }
                    let better = match best {
                        Some(b) => p.len() > b.destination.prefix_len(),
                        None => true,
                    };
                    if better {
                        best = Some(route);
                    }
                }
            }
        }

        best
    }
}

impl<A: IpAddress> fmt::Display for RoutingTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for route in &self.routes {
            writeln!(f, "{}", route)?;
        }
        Ok(())
    }
}
