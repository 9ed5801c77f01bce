//! Stateful NAT policy
//!
//! Sits on an `Ipv4Node` with an internal and an external interface.
//! Traffic from the internal side that leaves the internal prefixes gets
//! its source socket address rewritten to the external address and a port
//! from the pool; replies on the external side are mapped back. ICMP echo
//! uses the identifier in place of a port.

use super::interface::{same_interface, InterfaceRef};
use super::ipv4_node::Ipv4Node;
use super::lock;
use super::nat_table::{NatEntry, NatProtocol, NatTable, PortPool};
use super::node::NodeCore;
use super::policy::ForwardingPolicy;
use crate::protocol::icmp::IcmpMutablePacket;
use crate::protocol::ipv4::Ipv4Packet;
use crate::protocol::tcp::TcpPacket;
use crate::protocol::udp::UdpPacket;
use crate::protocol::Prefix;
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatConfig {
    /// Defaults to the first unicast address of the external interface
    pub external_addr: Option<Ipv4Addr>,
    pub first_port: u16,
    pub last_port: u16,
    pub entry_timeout: Duration,
    pub sweep_interval: Duration,
    /// Return ports to the pool when their last entry expires
    pub reclaim_ports: bool,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            external_addr: None,
            first_port: 6200,
            last_port: 6299,
            entry_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1200),
            reclaim_ports: true,
        }
    }
}

/// Result of translating one packet
#[derive(Debug)]
pub enum NatResult {
    Translated(Ipv4Packet),
    /// Not subject to translation
    PassThrough(Ipv4Packet),
    /// Inbound packet with neither a tracking entry nor a static mapping
    NoMapping,
    PortsExhausted,
    /// Protocol or ICMP type the NAT does not translate
    Unsupported,
    Error(String),
}

/// Port-carrying transport header
trait PortHeader: Sized {
    fn parse(data: &[u8]) -> Result<Self>;
    fn src_port(&self) -> u16;
    fn dst_port(&self) -> u16;
    fn set_src_port(&mut self, port: u16);
    fn set_dst_port(&mut self, port: u16);
    fn update_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr);
    fn into_bytes(self) -> Vec<u8>;
}

macro_rules! port_header {
    ($ty:ty) => {
        impl PortHeader for $ty {
            fn parse(data: &[u8]) -> Result<Self> {
                <$ty>::from_bytes(data)
            }
            fn src_port(&self) -> u16 {
                <$ty>::src_port(self)
            }
            fn dst_port(&self) -> u16 {
                <$ty>::dst_port(self)
            }
            fn set_src_port(&mut self, port: u16) {
                <$ty>::set_src_port(self, port)
            }
            fn set_dst_port(&mut self, port: u16) {
                <$ty>::set_dst_port(self, port)
            }
            fn update_checksum(&mut self, src: Ipv4Addr, dst: Ipv4Addr) {
                <$ty>::update_checksum(self, src, dst)
            }
            fn into_bytes(self) -> Vec<u8> {
                <$ty>::into_bytes(self)
            }
        }
    };
}

port_header!(UdpPacket);
port_header!(TcpPacket);

/// Tracking state for UDP or TCP
struct PortState {
    table: NatTable,
    pool: PortPool,
    statics: HashMap<SocketAddrV4, SocketAddrV4>,
}

impl PortState {
    /// A port stays out of the pool while a static mapping or a tracked
    /// entry holds it.
    fn holds(&self, external: SocketAddrV4) -> bool {
        self.statics.keys().any(|s| s.port() == external.port()) || self.table.uses_external(external)
    }
}

struct IcmpState {
    table: NatTable,
    next_id: u16,
}

impl IcmpState {
    /// Next nonzero identifier no tracked entry uses on `external_addr`.
    fn allocate_id(&mut self, external_addr: Ipv4Addr) -> Option<u16> {
        for _ in 0..u16::MAX {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                continue;
            }
            if !self.table.uses_external(SocketAddrV4::new(external_addr, self.next_id)) {
                return Some(self.next_id);
            }
        }
        None
    }
}

pub struct NatPolicy {
    internal: InterfaceRef<Ipv4Addr>,
    external: InterfaceRef<Ipv4Addr>,
    external_addr: Ipv4Addr,
    internal_prefixes: Vec<Prefix<Ipv4Addr>>,
    reclaim_ports: bool,
    udp: Mutex<PortState>,
    tcp: Mutex<PortState>,
    icmp: Mutex<IcmpState>,
    metrics: Arc<MetricsRegistry>,
}

impl NatPolicy {
    pub fn new(
        internal: InterfaceRef<Ipv4Addr>,
        external: InterfaceRef<Ipv4Addr>,
        config: NatConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        if same_interface(&internal, &external) {
            return Err(Error::Config(
                "nat internal and external interfaces must differ".into(),
            ));
        }
        if config.first_port == 0 || config.first_port > config.last_port {
            return Err(Error::Config(format!(
                "invalid nat port range {}-{}",
                config.first_port, config.last_port
            )));
        }

        let external_addr = match config.external_addr {
            Some(addr) => addr,
            None => external
                .addresses()
                .iter()
                .find(|a| a.is_unicast())
                .map(|a| a.addr)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "external interface {} has no unicast address",
                        external.name()
                    ))
                })?,
        };

        let internal_prefixes = internal
            .addresses()
            .iter()
            .filter(|a| a.is_unicast())
            .filter_map(|a| a.prefix())
            .collect();

        let port_state = || {
            Mutex::new(PortState {
                table: NatTable::new(config.entry_timeout, config.sweep_interval),
                pool: PortPool::new(config.first_port, config.last_port),
                statics: HashMap::new(),
            })
        };

        Ok(Self {
            internal,
            external,
            external_addr,
            internal_prefixes,
            reclaim_ports: config.reclaim_ports,
            udp: port_state(),
            tcp: port_state(),
            icmp: Mutex::new(IcmpState {
                table: NatTable::new(config.entry_timeout, config.sweep_interval),
                next_id: 0,
            }),
            metrics,
        })
    }

    /// Build the policy for two interfaces of `node`, install it and turn
    /// forwarding on.
    pub fn install(
        node: &Ipv4Node,
        internal: InterfaceRef<Ipv4Addr>,
        external: InterfaceRef<Ipv4Addr>,
        config: NatConfig,
    ) -> Result<Arc<Self>> {
        let policy = Arc::new(Self::new(internal, external, config, node.metrics().clone())?);
        node.set_policy(policy.clone());
        node.set_forwarding(true);
        info!(
            internal = %policy.internal.name(),
            external = %policy.external.name(),
            external_addr = %policy.external_addr,
            "nat enabled"
        );
        Ok(policy)
    }

    pub fn external_addr(&self) -> Ipv4Addr {
        self.external_addr
    }

    pub fn internal_prefixes(&self) -> &[Prefix<Ipv4Addr>] {
        &self.internal_prefixes
    }

    /// Owned by the node or inside an internal prefix
    pub fn is_internal(&self, core: &NodeCore<Ipv4Addr>, addr: Ipv4Addr) -> bool {
        core.has_address(addr) || self.internal_prefixes.iter().any(|p| p.contains(addr))
    }

    fn port_state(&self, proto: NatProtocol) -> Option<&Mutex<PortState>> {
        match proto {
            NatProtocol::Udp => Some(&self.udp),
            NatProtocol::Tcp => Some(&self.tcp),
            NatProtocol::Icmp => None,
        }
    }

    pub fn add_static(
        &self,
        proto: NatProtocol,
        external: SocketAddrV4,
        internal: SocketAddrV4,
    ) -> Result<()> {
        let state = self.port_state(proto).ok_or_else(|| {
            Error::Config("static mappings support udp and tcp only".into())
        })?;
        let mut state = lock(state);
        state.pool.reserve(external.port());
        state.statics.insert(external, internal);
        info!(proto = proto.name(), %external, %internal, "static mapping added");
        Ok(())
    }

    pub fn remove_static(&self, proto: NatProtocol, external: SocketAddrV4) -> bool {
        let Some(state) = self.port_state(proto) else {
            return false;
        };
        let mut state = lock(state);
        let removed = state.statics.remove(&external).is_some();
        if removed {
            // entries seeded from the mapping keep the port until they expire
            if !state.holds(external) {
                state.pool.release(external.port());
            }
            info!(proto = proto.name(), %external, "static mapping removed");
        }
        removed
    }

    pub fn static_mappings(&self, proto: NatProtocol) -> Vec<(SocketAddrV4, SocketAddrV4)> {
        let Some(state) = self.port_state(proto) else {
            return Vec::new();
        };
        let mut mappings: Vec<_> = lock(state)
            .statics
            .iter()
            .map(|(ext, int)| (*ext, *int))
            .collect();
        mappings.sort_by_key(|(ext, _)| ext.port());
        mappings
    }

    /// Snapshot of one tracking table
    pub fn entries(&self, proto: NatProtocol) -> Vec<NatEntry> {
        match self.port_state(proto) {
            Some(state) => lock(state).table.entries(),
            None => lock(&self.icmp).table.entries(),
        }
    }

    pub fn len(&self, proto: NatProtocol) -> usize {
        match self.port_state(proto) {
            Some(state) => lock(state).table.len(),
            None => lock(&self.icmp).table.len(),
        }
    }

    /// Free ports left in the UDP or TCP pool
    pub fn available_ports(&self, proto: NatProtocol) -> usize {
        self.port_state(proto)
            .map(|state| lock(state).pool.available())
            .unwrap_or(0)
    }

    fn update_gauge(&self) {
        let total =
            self.len(NatProtocol::Udp) + self.len(NatProtocol::Tcp) + self.len(NatProtocol::Icmp);
        self.metrics.set_nat_entries(total);
    }

    fn reclaim(&self, state: &mut PortState) {
        for entry in state.table.take_released() {
            if self.reclaim_ports && !state.holds(entry.external) {
                state.pool.release(entry.external.port());
            }
            trace!(internal = %entry.internal, external = %entry.external, "nat entry expired");
        }
    }

    /// Translate a packet received on the internal interface.
    pub fn translate_outbound(&self, packet: Ipv4Packet) -> NatResult {
        match NatProtocol::from_u8(packet.protocol()) {
            Some(NatProtocol::Udp) => self.outbound_ports::<UdpPacket>(NatProtocol::Udp, packet),
            Some(NatProtocol::Tcp) => self.outbound_ports::<TcpPacket>(NatProtocol::Tcp, packet),
            Some(NatProtocol::Icmp) => self.outbound_echo(packet),
            None => NatResult::Unsupported,
        }
    }

    /// Translate a packet received on the external interface.
    pub fn translate_inbound(&self, packet: Ipv4Packet) -> NatResult {
        match NatProtocol::from_u8(packet.protocol()) {
            Some(NatProtocol::Udp) => self.inbound_ports::<UdpPacket>(NatProtocol::Udp, packet),
            Some(NatProtocol::Tcp) => self.inbound_ports::<TcpPacket>(NatProtocol::Tcp, packet),
            Some(NatProtocol::Icmp) => self.inbound_echo(packet),
            None => NatResult::Unsupported,
        }
    }

    fn outbound_ports<T: PortHeader>(&self, proto: NatProtocol, mut packet: Ipv4Packet) -> NatResult {
        let mut header = match T::parse(packet.payload()) {
            Ok(h) => h,
            Err(e) => return NatResult::Error(e.to_string()),
        };
        let internal = SocketAddrV4::new(packet.src_addr(), header.src_port());
        let remote = SocketAddrV4::new(packet.dst_addr(), header.dst_port());

        let entry = {
            let Some(state) = self.port_state(proto) else {
                return NatResult::Unsupported;
            };
            let mut state = lock(state);
            let found = state.table.lookup_outbound(internal, remote);
            self.reclaim(&mut state);
            match found {
                Some(entry) => entry,
                None => {
                    let Some(port) = state.pool.take() else {
                        warn!(proto = proto.name(), %internal, %remote, "nat port pool exhausted");
                        self.metrics.nat_pool_exhausted.inc();
                        return NatResult::PortsExhausted;
                    };
                    let entry = NatEntry::new(
                        internal,
                        SocketAddrV4::new(self.external_addr, port),
                        remote,
                        true,
                    );
                    debug!(proto = proto.name(), %internal, external = %entry.external, %remote, "nat entry created");
                    state.table.add(entry.clone());
                    entry
                }
            }
        };

        header.set_src_port(entry.external.port());
        header.update_checksum(self.external_addr, *remote.ip());
        packet.set_payload(&header.into_bytes());
        packet.set_src_addr(self.external_addr);
        NatResult::Translated(packet)
    }

    fn inbound_ports<T: PortHeader>(&self, proto: NatProtocol, mut packet: Ipv4Packet) -> NatResult {
        let mut header = match T::parse(packet.payload()) {
            Ok(h) => h,
            Err(e) => return NatResult::Error(e.to_string()),
        };
        let remote = SocketAddrV4::new(packet.src_addr(), header.src_port());
        let external = SocketAddrV4::new(packet.dst_addr(), header.dst_port());

        let entry = {
            let Some(state) = self.port_state(proto) else {
                return NatResult::Unsupported;
            };
            let mut state = lock(state);
            let found = state.table.lookup_inbound(remote, external);
            self.reclaim(&mut state);
            match found {
                Some(entry) => entry,
                None => {
                    let Some(internal) = state.statics.get(&external).copied() else {
                        return NatResult::NoMapping;
                    };
                    let entry = NatEntry::new(internal, external, remote, false);
                    debug!(proto = proto.name(), %internal, %external, %remote, "nat entry created from static mapping");
                    state.table.add(entry.clone());
                    entry
                }
            }
        };

        let internal_ip = *entry.internal.ip();
        header.set_dst_port(entry.internal.port());
        header.update_checksum(*remote.ip(), internal_ip);
        packet.set_payload(&header.into_bytes());
        packet.set_dst_addr(internal_ip);
        NatResult::Translated(packet)
    }

    fn outbound_echo(&self, mut packet: Ipv4Packet) -> NatResult {
        let mut icmp = match IcmpMutablePacket::from_bytes(packet.payload()) {
            Ok(p) => p,
            Err(e) => return NatResult::Error(e.to_string()),
        };
        if !icmp.is_echo_request() {
            return NatResult::Unsupported;
        }
        let internal = SocketAddrV4::new(packet.src_addr(), icmp.identifier());
        let remote = SocketAddrV4::new(packet.dst_addr(), 0);

        let entry = {
            let mut state = lock(&self.icmp);
            let found = state.table.lookup_outbound(internal, remote);
            state.table.take_released();
            match found {
                Some(entry) => entry,
                None => {
                    let Some(id) = state.allocate_id(self.external_addr) else {
                        warn!(%internal, %remote, "nat echo identifiers exhausted");
                        self.metrics.nat_pool_exhausted.inc();
                        return NatResult::PortsExhausted;
                    };
                    let entry =
                        NatEntry::new(internal, SocketAddrV4::new(self.external_addr, id), remote, false);
                    debug!(%internal, external_id = id, %remote, "nat echo entry created");
                    state.table.add(entry.clone());
                    entry
                }
            }
        };

        icmp.set_identifier(entry.external.port());
        packet.set_payload(icmp.as_bytes());
        packet.set_src_addr(self.external_addr);
        NatResult::Translated(packet)
    }

    fn inbound_echo(&self, mut packet: Ipv4Packet) -> NatResult {
        let mut icmp = match IcmpMutablePacket::from_bytes(packet.payload()) {
            Ok(p) => p,
            Err(e) => return NatResult::Error(e.to_string()),
        };
        if !icmp.is_echo_reply() {
            return NatResult::Unsupported;
        }
        let remote = SocketAddrV4::new(packet.src_addr(), 0);
        let external = SocketAddrV4::new(packet.dst_addr(), icmp.identifier());

        let entry = {
            let mut state = lock(&self.icmp);
            let found = state.table.lookup_inbound(remote, external);
            state.table.take_released();
            match found {
                Some(entry) => entry,
                None => return NatResult::NoMapping,
            }
        };

        icmp.set_identifier(entry.internal.port());
        packet.set_payload(icmp.as_bytes());
        packet.set_dst_addr(*entry.internal.ip());
        NatResult::Translated(packet)
    }
}

impl ForwardingPolicy<Ipv4Packet> for NatPolicy {
    fn on_receive(
        &self,
        core: &NodeCore<Ipv4Addr>,
        ingress: &InterfaceRef<Ipv4Addr>,
        packet: Ipv4Packet,
    ) -> Option<Ipv4Packet> {
        let dst = packet.dst_addr();
        let result = if same_interface(ingress, &self.internal) {
            if self.is_internal(core, dst) {
                NatResult::PassThrough(packet)
            } else {
                let result = self.translate_outbound(packet);
                if matches!(result, NatResult::Translated(_)) {
                    self.metrics.nat_translated_out.inc();
                }
                result
            }
        } else if same_interface(ingress, &self.external) {
            if !self.is_internal(core, dst) {
                NatResult::PassThrough(packet)
            } else {
                let result = self.translate_inbound(packet);
                if matches!(result, NatResult::Translated(_)) {
                    self.metrics.nat_translated_in.inc();
                }
                result
            }
        } else {
            NatResult::PassThrough(packet)
        };

        match result {
            NatResult::PassThrough(packet) => Some(packet),
            NatResult::Translated(packet) => {
                self.update_gauge();
                Some(packet)
            }
            other => {
                debug!(iface = %ingress.name(), %dst, result = ?other, "nat dropped packet");
                self.metrics.nat_dropped.inc();
                None
            }
        }
    }
}
