//! Node assembly from configuration
//!
//! A `Stack` is the pair of IPv4/IPv6 nodes described by a `Config`, with
//! its interfaces, static routes and optional NAT in place. Where the
//! interfaces come from is left to an `InterfaceFactory`, so the same
//! assembly drives raw sockets, in-memory hubs or detached links.

use crate::capture::Capture;
use crate::config::{self, Config, InterfaceConfig, StaticRoute};
use crate::dataplane::{
    same_interface, Destination, EthConfig, EthInterface, IfAddr, InterfaceRef, IpLink,
    IpLinkInterface, Ipv4Node, Ipv6Node, NatPolicy, NodeConfig, Route, RoutingTable,
};
use crate::protocol::{IpAddress, MacAddr, Prefix};
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4};
use std::sync::Arc;
use tracing::{debug, info};

/// Creates the per-family interface for a configured device.
pub trait InterfaceFactory {
    fn ipv4(&mut self, config: &InterfaceConfig) -> Result<InterfaceRef<Ipv4Addr>>;
    fn ipv6(&mut self, config: &InterfaceConfig) -> Result<InterfaceRef<Ipv6Addr>>;
}

/// Interfaces on private in-process links. Nothing reaches the network,
/// which is what route inspection wants.
pub struct DetachedInterfaces {
    v4: Arc<IpLink<Ipv4Addr>>,
    v6: Arc<IpLink<Ipv6Addr>>,
}

impl Default for DetachedInterfaces {
    fn default() -> Self {
        Self {
            v4: IpLink::new(Prefix::masked(Ipv4Addr::UNSPECIFIED, 0)),
            v6: IpLink::new(Prefix::masked(Ipv6Addr::UNSPECIFIED, 0)),
        }
    }
}

impl InterfaceFactory for DetachedInterfaces {
    fn ipv4(&mut self, _config: &InterfaceConfig) -> Result<InterfaceRef<Ipv4Addr>> {
        Ok(IpLinkInterface::with_address(&self.v4, None))
    }

    fn ipv6(&mut self, _config: &InterfaceConfig) -> Result<InterfaceRef<Ipv6Addr>> {
        Ok(IpLinkInterface::with_address(&self.v6, None))
    }
}

/// Ethernet interfaces over captures returned by `open`, which yields the
/// capture for a device name together with the device's own MAC.
pub struct EthernetInterfaces<F> {
    open: F,
    resolver: config::ResolverConfig,
    metrics: Arc<MetricsRegistry>,
}

impl<C, F> EthernetInterfaces<F>
where
    C: Capture,
    F: FnMut(&str) -> Result<(C, MacAddr)>,
{
    pub fn new(open: F, resolver: config::ResolverConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            open,
            resolver,
            metrics,
        }
    }

    fn open(&mut self, config: &InterfaceConfig) -> Result<(C, MacAddr)> {
        let (capture, device_mac) = (self.open)(&config.name)?;
        let mac = match config.mac.as_deref() {
            Some(s) => s
                .parse()
                .map_err(|_| Error::Config(format!("interfaces.{}: invalid mac {}", config.name, s)))?,
            None => device_mac,
        };
        Ok((capture, mac))
    }
}

impl<C, F> InterfaceFactory for EthernetInterfaces<F>
where
    C: Capture,
    F: FnMut(&str) -> Result<(C, MacAddr)>,
{
    fn ipv4(&mut self, config: &InterfaceConfig) -> Result<InterfaceRef<Ipv4Addr>> {
        let (capture, mac) = self.open(config)?;
        let eth = EthConfig::new(&config.name, mac, self.resolver.ipv4());
        let iface: InterfaceRef<Ipv4Addr> = EthInterface::<Ipv4Addr, C>::spawn(eth, capture, self.metrics.clone())?;
        Ok(iface)
    }

    fn ipv6(&mut self, config: &InterfaceConfig) -> Result<InterfaceRef<Ipv6Addr>> {
        let (capture, mac) = self.open(config)?;
        let eth = EthConfig::new(&config.name, mac, self.resolver.ipv6());
        let iface: InterfaceRef<Ipv6Addr> = EthInterface::<Ipv6Addr, C>::spawn(eth, capture, self.metrics.clone())?;
        Ok(iface)
    }
}

type Named<A> = Vec<(String, InterfaceRef<A>)>;

pub struct Stack {
    ipv4: Arc<Ipv4Node>,
    ipv6: Arc<Ipv6Node>,
    ipv4_interfaces: Named<Ipv4Addr>,
    ipv6_interfaces: Named<Ipv6Addr>,
    nat: Option<Arc<NatPolicy>>,
}

impl Stack {
    pub fn build(
        config: &Config,
        factory: &mut impl InterfaceFactory,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let node_config = |ip: &config::IpConfig| NodeConfig {
            forwarding: config.routing.forwarding,
            send_icmp_dest_unreachable: ip.send_icmp_dest_unreachable,
            discard_broadcast_echo_requests: ip.discard_broadcast_echo_requests,
        };

        let mut stack = Self {
            ipv4: Ipv4Node::with_metrics(node_config(&config.ipv4), metrics.clone()),
            ipv6: Ipv6Node::with_metrics(node_config(&config.ipv6), metrics),
            ipv4_interfaces: Vec::new(),
            ipv6_interfaces: Vec::new(),
            nat: None,
        };

        for iface in &config.interfaces {
            stack.attach(iface, factory)?;
        }
        for route in &config.routing.static_routes {
            stack.add_route(route)?;
        }
        if let Some(nat) = &config.nat {
            stack.enable_nat(nat)?;
        }

        info!(
            ipv4_interfaces = stack.ipv4_interfaces.len(),
            ipv6_interfaces = stack.ipv6_interfaces.len(),
            forwarding = config.routing.forwarding,
            nat = stack.nat.is_some(),
            "stack assembled"
        );
        Ok(stack)
    }

    fn attach(&mut self, config: &InterfaceConfig, factory: &mut impl InterfaceFactory) -> Result<()> {
        if !config.ipv4.is_empty() {
            let addrs = parse_addresses::<Ipv4Addr>(&config.ipv4)?;
            let iface = factory.ipv4(config)?;
            self.ipv4.add_interface(iface.clone());
            for addr in addrs {
                self.ipv4.add_address(&iface, addr);
            }
            self.ipv4_interfaces.push((config.name.clone(), iface));
        }
        if !config.ipv6.is_empty() {
            let addrs = parse_addresses::<Ipv6Addr>(&config.ipv6)?;
            let iface = factory.ipv6(config)?;
            self.ipv6.add_interface(iface.clone());
            for addr in addrs {
                self.ipv6.add_address(&iface, addr);
            }
            self.ipv6_interfaces.push((config.name.clone(), iface));
        }
        Ok(())
    }

    fn add_route(&self, route: &StaticRoute) -> Result<()> {
        if route.destination.contains(':') {
            install_route(&mut self.ipv6.routing_table(), &self.ipv6_interfaces, route)
        } else {
            install_route(&mut self.ipv4.routing_table(), &self.ipv4_interfaces, route)
        }
    }

    fn enable_nat(&mut self, config: &config::NatConfig) -> Result<()> {
        let internal = find(&self.ipv4_interfaces, &config.internal)?;
        let external = find(&self.ipv4_interfaces, &config.external)?;
        let policy = NatPolicy::install(&self.ipv4, internal, external, config.translation())?;

        for mapping in &config.static_mappings {
            policy.add_static(
                mapping.protocol.into(),
                SocketAddrV4::new(policy.external_addr(), mapping.external_port),
                SocketAddrV4::new(mapping.internal_address, mapping.internal_port),
            )?;
        }
        self.nat = Some(policy);
        Ok(())
    }

    pub fn ipv4(&self) -> &Arc<Ipv4Node> {
        &self.ipv4
    }

    pub fn ipv6(&self) -> &Arc<Ipv6Node> {
        &self.ipv6
    }

    pub fn nat(&self) -> Option<&Arc<NatPolicy>> {
        self.nat.as_ref()
    }

    /// IPv4 interface built for the configured device `name`
    pub fn ipv4_interface(&self, name: &str) -> Option<InterfaceRef<Ipv4Addr>> {
        find(&self.ipv4_interfaces, name).ok()
    }

    pub fn ipv6_interface(&self, name: &str) -> Option<InterfaceRef<Ipv6Addr>> {
        find(&self.ipv6_interfaces, name).ok()
    }

    /// Route chosen for `addr`, printed with configured device names.
    pub fn describe_route(&self, addr: IpAddr) -> Option<String> {
        match addr {
            IpAddr::V4(a) => {
                let table = self.ipv4.routing_table();
                table.get_route(a).map(|r| describe(r, &self.ipv4_interfaces))
            }
            IpAddr::V6(a) => {
                let table = self.ipv6.routing_table();
                table.get_route(a).map(|r| describe(r, &self.ipv6_interfaces))
            }
        }
    }

    pub fn close(&self) {
        self.ipv4.close();
        self.ipv6.close();
        info!("stack closed");
    }
}

fn parse_addresses<A: IpAddress>(addrs: &[String]) -> Result<Vec<IfAddr<A>>> {
    addrs.iter().map(|a| a.parse()).collect()
}

fn find<A: IpAddress>(interfaces: &Named<A>, name: &str) -> Result<InterfaceRef<A>> {
    interfaces
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, iface)| iface.clone())
        .ok_or_else(|| Error::InterfaceNotFound {
            name: name.to_string(),
        })
}

fn install_route<A: IpAddress>(
    table: &mut RoutingTable<A>,
    interfaces: &Named<A>,
    route: &StaticRoute,
) -> Result<()> {
    let destination: Destination<A> = route.destination.parse()?;
    let gateway = match route.gateway.as_deref() {
        Some(g) => Some(
            g.parse::<A>()
                .map_err(|_| Error::Parse(format!("invalid {} gateway: {}", A::FAMILY, g)))?,
        ),
        None => None,
    };

    match (&route.interface, gateway) {
        (Some(name), gateway) => table.add(Route::new(destination, gateway, find(interfaces, name)?)),
        (None, Some(gateway)) => table.add_via(destination, gateway)?,
        (None, None) => {
            return Err(Error::Config(format!(
                "route {} needs a gateway or an interface",
                route.destination
            )))
        }
    }
    debug!(destination = %route.destination, gateway = ?route.gateway, "static route added");
    Ok(())
}

fn describe<A: IpAddress>(route: &Route<A>, interfaces: &Named<A>) -> String {
    let dev = interfaces
        .iter()
        .find(|(_, iface)| same_interface(iface, &route.interface))
        .map(|(name, _)| name.clone())
        .unwrap_or_else(|| route.interface.name());
    match route.next_hop {
        Some(nh) => format!("{} via {} dev {}", route.destination, nh, dev),
        None => format!("{} dev {}", route.destination, dev),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::NatProtocol;

    const CONFIG: &str = r#"
[[interfaces]]
name = "lan"
ipv4 = ["10.0.0.1/24"]
ipv6 = ["2001:db8:1::1/64"]

[[interfaces]]
name = "wan"
ipv4 = ["203.0.113.2/24"]

[routing]
forwarding = true

[[routing.static_routes]]
destination = "0.0.0.0/0"
gateway = "203.0.113.1"

[[routing.static_routes]]
destination = "2001:db8:99::/48"
gateway = "2001:db8:1::fe"
interface = "lan"

[nat]
internal = "lan"
external = "wan"

[[nat.static_mappings]]
protocol = "udp"
external_port = 5353
internal_address = "10.0.0.5"
internal_port = 53
"#;

    fn build() -> Stack {
        let config = config::parse(CONFIG).unwrap();
        Stack::build(
            &config,
            &mut DetachedInterfaces::default(),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_routes_use_device_names() {
        let stack = build();
        assert_eq!(
            stack.describe_route("8.8.8.8".parse().unwrap()).as_deref(),
            Some("0.0.0.0/0 via 203.0.113.1 dev wan")
        );
        assert_eq!(
            stack.describe_route("10.0.0.77".parse().unwrap()).as_deref(),
            Some("10.0.0.0/24 dev lan")
        );
        assert_eq!(
            stack.describe_route("2001:db8:99::1".parse().unwrap()).as_deref(),
            Some("2001:db8:99::/48 via 2001:db8:1::fe dev lan")
        );
        assert_eq!(stack.describe_route("2001:db9::1".parse().unwrap()), None);
    }

    #[test]
    fn test_interfaces_per_family() {
        let stack = build();
        assert!(stack.ipv4_interface("lan").is_some());
        assert!(stack.ipv6_interface("lan").is_some());
        assert!(stack.ipv6_interface("wan").is_none());
        assert!(stack.ipv4().has_address("203.0.113.2".parse().unwrap()));
        assert!(stack.ipv6().has_address("2001:db8:1::1".parse().unwrap()));
    }

    #[test]
    fn test_nat_installed_with_static_mappings() {
        let stack = build();
        assert!(stack.ipv4().forwarding());
        let nat = stack.nat().unwrap();
        assert_eq!(nat.external_addr(), Ipv4Addr::new(203, 0, 113, 2));
        assert_eq!(
            nat.static_mappings(NatProtocol::Udp),
            vec![(
                "203.0.113.2:5353".parse::<SocketAddrV4>().unwrap(),
                "10.0.0.5:53".parse::<SocketAddrV4>().unwrap()
            )]
        );
    }

    #[test]
    fn test_route_through_unknown_interface_fails() {
        let mut config = config::parse(CONFIG).unwrap();
        config.routing.static_routes[0].interface = Some("dmz".to_string());
        let err = Stack::build(
            &config,
            &mut DetachedInterfaces::default(),
            Arc::new(MetricsRegistry::new()),
        );
        assert!(matches!(err, Err(Error::InterfaceNotFound { .. })));
    }

    #[test]
    fn test_bad_address_fails() {
        let mut config = config::parse(CONFIG).unwrap();
        config.interfaces[1].ipv4 = vec!["203.0.113.500/24".to_string()];
        assert!(Stack::build(
            &config,
            &mut DetachedInterfaces::default(),
            Arc::new(MetricsRegistry::new()),
        )
        .is_err());
    }

    #[test]
    fn test_close_clears_routes() {
        let stack = build();
        stack.close();
        assert!(stack.ipv4().routing_table().is_empty());
    }
}
