//! Configuration validation

use super::{Config, StaticRoute};
use crate::dataplane::{Destination, IfAddr};
use crate::protocol::{IpAddress, MacAddr};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_logging(config, &mut result);
    validate_interfaces(config, &mut result);
    validate_routing(config, &mut result);
    validate_resolver(config, &mut result);
    validate_nat(config, &mut result);

    result
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    if !config.logging.has_known_level() {
        result.warn(format!(
            "logging.level: unknown level '{}', using info",
            config.logging.level
        ));
    }
}

fn validate_interfaces(config: &Config, result: &mut ValidationResult) {
    if config.interfaces.is_empty() {
        result.warn("interfaces: none configured");
    }

    let mut seen = HashSet::new();
    for (i, iface) in config.interfaces.iter().enumerate() {
        if iface.name.is_empty() {
            result.error(format!("interfaces[{}]: name is empty", i));
        } else if !seen.insert(iface.name.as_str()) {
            result.error(format!("interfaces[{}]: duplicate name '{}'", i, iface.name));
        }

        if iface.ipv4.is_empty() && iface.ipv6.is_empty() {
            result.warn(format!("interfaces.{}: no addresses, interface unused", iface.name));
        }
        check_addresses::<Ipv4Addr>(&iface.name, "ipv4", &iface.ipv4, result);
        check_addresses::<Ipv6Addr>(&iface.name, "ipv6", &iface.ipv6, result);

        if let Some(ref mac) = iface.mac {
            match mac.parse::<MacAddr>() {
                Ok(m) if m.is_multicast() => {
                    result.error(format!("interfaces.{}.mac: {} is a group address", iface.name, mac))
                }
                Ok(_) => {}
                Err(_) => result.error(format!("interfaces.{}.mac: invalid address '{}'", iface.name, mac)),
            }
        }
    }
}

fn check_addresses<A: IpAddress>(name: &str, key: &str, addrs: &[String], result: &mut ValidationResult) {
    for addr in addrs {
        match addr.parse::<IfAddr<A>>() {
            Ok(a) if !a.is_unicast() => {
                result.error(format!("interfaces.{}.{}: {} is not a unicast address", name, key, addr))
            }
            Ok(a) if a.prefix_len.is_none() => result.warn(format!(
                "interfaces.{}.{}: {} has no prefix length, no connected route",
                name, key, addr
            )),
            Ok(_) => {}
            Err(e) => result.error(format!("interfaces.{}.{}: {}", name, key, e)),
        }
    }
}

fn is_ipv6(addr: &str) -> bool {
    addr.contains(':')
}

fn validate_routing(config: &Config, result: &mut ValidationResult) {
    for (i, route) in config.routing.static_routes.iter().enumerate() {
        if let Some(ref iface) = route.interface {
            if config.interface(iface).is_none() {
                result.error(format!(
                    "routing.static_routes[{}]: interface '{}' not defined",
                    i, iface
                ));
            }
        }
        if route.gateway.is_none() && route.interface.is_none() {
            result.error(format!(
                "routing.static_routes[{}]: needs a gateway or an interface",
                i
            ));
        }

        if is_ipv6(&route.destination) {
            check_route::<Ipv6Addr>(i, route, result);
        } else {
            check_route::<Ipv4Addr>(i, route, result);
        }
    }
}

fn check_route<A: IpAddress>(i: usize, route: &StaticRoute, result: &mut ValidationResult) {
    if let Err(e) = route.destination.parse::<Destination<A>>() {
        result.error(format!("routing.static_routes[{}]: destination: {}", i, e));
    }
    if let Some(ref gateway) = route.gateway {
        match gateway.parse::<A>() {
            Ok(gw) if gw.is_multicast() => result.error(format!(
                "routing.static_routes[{}]: gateway {} is a multicast address",
                i, gateway
            )),
            Ok(_) => {}
            Err(_) => result.error(format!(
                "routing.static_routes[{}]: gateway '{}' is not an {} address",
                i,
                gateway,
                A::FAMILY
            )),
        }
    }
}

fn validate_resolver(config: &Config, result: &mut ValidationResult) {
    let resolver = &config.resolver;
    if resolver.max_attempts == 0 {
        result.error("resolver.max_attempts: must be at least 1");
    }
    if resolver.retransmit_timeout_ms == 0 {
        result.error("resolver.retransmit_timeout_ms: must be positive");
    }
    if !resolver.cache {
        result.warn("resolver.cache: disabled, every send resolves its next hop");
    }
}

fn validate_nat(config: &Config, result: &mut ValidationResult) {
    let Some(nat) = &config.nat else {
        return;
    };

    for (key, name) in [("internal", &nat.internal), ("external", &nat.external)] {
        match config.interface(name) {
            None => result.error(format!("nat.{}: interface '{}' not defined", key, name)),
            Some(iface) if iface.ipv4.is_empty() => result.error(format!(
                "nat.{}: interface '{}' has no ipv4 address",
                key, name
            )),
            Some(_) => {}
        }
    }
    if nat.internal == nat.external {
        result.error(format!(
            "nat: internal and external are the same interface '{}'",
            nat.internal
        ));
    }

    if nat.port_range_start == 0 {
        result.error("nat.port_range_start: port 0 cannot be allocated");
    }
    if nat.port_range_start > nat.port_range_end {
        result.error(format!(
            "nat: empty port range {}-{}",
            nat.port_range_start, nat.port_range_end
        ));
    }
    if nat.entry_timeout_secs == 0 {
        result.warn("nat.entry_timeout_secs: 0 expires every entry immediately");
    }
    if !nat.reclaim_ports {
        result.warn("nat.reclaim_ports: disabled, the port pool drains as flows expire");
    }
    if !config.routing.forwarding {
        result.warn("nat: enables forwarding although routing.forwarding is false");
    }

    let mut seen = HashSet::new();
    for (i, mapping) in nat.static_mappings.iter().enumerate() {
        if !seen.insert((mapping.protocol, mapping.external_port)) {
            result.error(format!(
                "nat.static_mappings[{}]: external port {} mapped twice",
                i, mapping.external_port
            ));
        }
        if nat.port_range().contains(&mapping.external_port) {
            result.warn(format!(
                "nat.static_mappings[{}]: external port {} is taken out of the dynamic pool",
                i, mapping.external_port
            ));
        }
        if mapping.external_port == 0 || mapping.internal_port == 0 {
            result.error(format!("nat.static_mappings[{}]: port 0", i));
        }
    }
}
