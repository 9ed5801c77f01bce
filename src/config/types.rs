//! Configuration types

use crate::dataplane::{NatProtocol, ResolverConfig as LinkResolverConfig};
use crate::telemetry::LogConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub ipv4: IpConfig,
    #[serde(default)]
    pub ipv6: IpConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<NatConfig>,
}

impl Config {
    pub fn interface(&self, name: &str) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InterfaceConfig {
    /// OS device the interface is bound to
    pub name: String,
    /// "addr/len" strings
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    /// Defaults to the device's hardware address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub forwarding: bool,
    #[serde(default)]
    pub static_routes: Vec<StaticRoute>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StaticRoute {
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Derived from the route to the gateway when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Per-family node behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct IpConfig {
    #[serde(default = "default_true")]
    pub send_icmp_dest_unreachable: bool,
    #[serde(default)]
    pub discard_broadcast_echo_requests: bool,
}

impl Default for IpConfig {
    fn default() -> Self {
        Self {
            send_icmp_dest_unreachable: true,
            discard_broadcast_echo_requests: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResolverConfig {
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default = "default_ipv4_cache_ms")]
    pub ipv4_cache_timeout_ms: u64,
    #[serde(default = "default_ipv6_cache_ms")]
    pub ipv6_cache_timeout_ms: u64,
    #[serde(default = "default_retransmit_ms")]
    pub retransmit_timeout_ms: u64,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache: true,
            ipv4_cache_timeout_ms: default_ipv4_cache_ms(),
            ipv6_cache_timeout_ms: default_ipv6_cache_ms(),
            retransmit_timeout_ms: default_retransmit_ms(),
            max_attempts: default_attempts(),
        }
    }
}

impl ResolverConfig {
    /// ARP client settings
    pub fn ipv4(&self) -> LinkResolverConfig {
        self.settings(self.ipv4_cache_timeout_ms)
    }

    /// Neighbor Discovery client settings
    pub fn ipv6(&self) -> LinkResolverConfig {
        self.settings(self.ipv6_cache_timeout_ms)
    }

    fn settings(&self, cache_ms: u64) -> LinkResolverConfig {
        LinkResolverConfig {
            cache_timeout: self.cache.then(|| Duration::from_millis(cache_ms)),
            retransmit_timeout: Duration::from_millis(self.retransmit_timeout_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatConfig {
    pub internal: String,
    pub external: String,
    /// Defaults to the first IPv4 address of the external interface
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_address: Option<Ipv4Addr>,
    #[serde(default = "default_port_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_end")]
    pub port_range_end: u16,
    #[serde(default = "default_entry_timeout")]
    pub entry_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_true")]
    pub reclaim_ports: bool,
    #[serde(default)]
    pub static_mappings: Vec<StaticMapping>,
}

impl NatConfig {
    pub fn new(internal: &str, external: &str) -> Self {
        Self {
            internal: internal.to_string(),
            external: external.to_string(),
            external_address: None,
            port_range_start: default_port_start(),
            port_range_end: default_port_end(),
            entry_timeout_secs: default_entry_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            reclaim_ports: true,
            static_mappings: Vec::new(),
        }
    }

    /// Translation settings for `NatPolicy`
    pub fn translation(&self) -> crate::dataplane::NatConfig {
        crate::dataplane::NatConfig {
            external_addr: self.external_address,
            first_port: self.port_range_start,
            last_port: self.port_range_end,
            entry_timeout: Duration::from_secs(self.entry_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            reclaim_ports: self.reclaim_ports,
        }
    }

    pub fn port_range(&self) -> std::ops::RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }
}

/// Port forwarding entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct StaticMapping {
    pub protocol: MappingProtocol,
    pub external_port: u16,
    pub internal_address: Ipv4Addr,
    pub internal_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingProtocol {
    Udp,
    Tcp,
}

impl From<MappingProtocol> for NatProtocol {
    fn from(proto: MappingProtocol) -> Self {
        match proto {
            MappingProtocol::Udp => NatProtocol::Udp,
            MappingProtocol::Tcp => NatProtocol::Tcp,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ipv4_cache_ms() -> u64 {
    20_000
}

fn default_ipv6_cache_ms() -> u64 {
    60_000
}

fn default_retransmit_ms() -> u64 {
    3_000
}

fn default_attempts() -> u32 {
    3
}

fn default_port_start() -> u16 {
    6200
}

fn default_port_end() -> u16 {
    6299
}

fn default_entry_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    1200
}

// ============================================================================
// Lock file types (generated, includes all defaults)
// ============================================================================

/// Generated lock file with all defaults filled in. It deserializes as a
/// `Config`, so `run` accepts either file.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigLock {
    pub generated_at: String,
    pub logging: LogConfig,
    pub interfaces: Vec<InterfaceConfig>,
    pub routing: RoutingConfig,
    pub ipv4: IpConfig,
    pub ipv6: IpConfig,
    pub resolver: ResolverConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nat: Option<NatConfig>,
}

impl ConfigLock {
    pub fn from_config(config: &Config) -> Self {
        ConfigLock {
            generated_at: chrono::Utc::now().to_rfc3339(),
            logging: config.logging.clone(),
            interfaces: config.interfaces.clone(),
            routing: config.routing.clone(),
            ipv4: config.ipv4,
            ipv6: config.ipv6,
            resolver: config.resolver,
            nat: config.nat.clone(),
        }
    }
}
