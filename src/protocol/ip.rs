//! Address families shared by the IPv4 and IPv6 layers
//!
//! `IpAddress` lets the routing table, resolver and node core be written once
//! for both families. `Prefix` is always checked: host bits must be zero.

use super::icmpv6::Icmpv6Type;
use super::ipv4::{Ipv4Packet, Protocol};
use super::ipv6::Ipv6Packet;
use super::types::MacAddr;
use crate::{Error, Result};
use std::fmt;
use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Operations the dataplane needs from a network-layer address.
pub trait IpAddress:
    Copy + Eq + Hash + Ord + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
    /// Address width in bits
    const BITS: u8;
    /// Family name used in logs
    const FAMILY: &'static str;
    /// Loopback address (127.0.0.1 or ::1)
    const LOOPBACK: Self;
    const UNSPECIFIED: Self;

    fn to_u128(self) -> u128;
    fn from_u128(bits: u128) -> Self;

    fn is_multicast(&self) -> bool;
    fn is_loopback(&self) -> bool;

    /// 255.255.255.255 for IPv4; IPv6 has no broadcast
    fn is_limited_broadcast(&self) -> bool;

    /// Link-layer group address a multicast destination maps to.
    fn multicast_mac(&self) -> MacAddr;

    /// Prefix owned by the implicit loopback interface.
    fn loopback_prefix() -> Prefix<Self>;
}

impl IpAddress for Ipv4Addr {
    const BITS: u8 = 32;
    const FAMILY: &'static str = "ipv4";
    const LOOPBACK: Self = Ipv4Addr::LOCALHOST;
    const UNSPECIFIED: Self = Ipv4Addr::UNSPECIFIED;

    fn to_u128(self) -> u128 {
        u32::from(self) as u128
    }

    fn from_u128(bits: u128) -> Self {
        Ipv4Addr::from(bits as u32)
    }

    fn is_multicast(&self) -> bool {
        Ipv4Addr::is_multicast(self)
    }

    fn is_loopback(&self) -> bool {
        Ipv4Addr::is_loopback(self)
    }

    fn is_limited_broadcast(&self) -> bool {
        self.is_broadcast()
    }

    // RFC 1112: 01:00:5e + low 23 bits
    fn multicast_mac(&self) -> MacAddr {
        let o = self.octets();
        MacAddr([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
    }

    fn loopback_prefix() -> Prefix<Self> {
        Prefix::masked(Ipv4Addr::new(127, 0, 0, 0), 8)
    }
}

impl IpAddress for Ipv6Addr {
    const BITS: u8 = 128;
    const FAMILY: &'static str = "ipv6";
    const LOOPBACK: Self = Ipv6Addr::LOCALHOST;
    const UNSPECIFIED: Self = Ipv6Addr::UNSPECIFIED;

    fn to_u128(self) -> u128 {
        u128::from(self)
    }

    fn from_u128(bits: u128) -> Self {
        Ipv6Addr::from(bits)
    }

    fn is_multicast(&self) -> bool {
        Ipv6Addr::is_multicast(self)
    }

    fn is_loopback(&self) -> bool {
        Ipv6Addr::is_loopback(self)
    }

    fn is_limited_broadcast(&self) -> bool {
        false
    }

    // RFC 2464: 33:33 + low 32 bits
    fn multicast_mac(&self) -> MacAddr {
        let o = self.octets();
        MacAddr([0x33, 0x33, o[12], o[13], o[14], o[15]])
    }

    fn loopback_prefix() -> Prefix<Self> {
        Prefix::masked(Ipv6Addr::LOCALHOST, 128)
    }
}

fn mask_bits<A: IpAddress>(len: u8) -> u128 {
    let width = A::BITS as u32;
    let len = (len as u32).min(width);
    if len == 0 {
        return 0;
    }
    let all = u128::MAX >> (128 - width);
    let host = if width - len == 128 {
        u128::MAX
    } else {
        (1u128 << (width - len)) - 1
    };
    all & !host
}

/// Network prefix with all host bits zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix<A> {
    addr: A,
    len: u8,
}

impl<A: IpAddress> Prefix<A> {
    /// Creates a prefix, rejecting a length beyond the address width or any
    /// bit set past the prefix length.
    pub fn new(addr: A, len: u8) -> Result<Self> {
        if len > A::BITS || addr.to_u128() & !mask_bits::<A>(len) != 0 {
            return Err(Error::InvalidPrefix {
                addr: addr.to_string(),
                len,
            });
        }
        Ok(Self { addr, len })
    }

    /// Creates the prefix that contains `addr`, clearing the host bits.
    pub fn masked(addr: A, len: u8) -> Self {
        let len = len.min(A::BITS);
        Self {
            addr: A::from_u128(addr.to_u128() & mask_bits::<A>(len)),
            len,
        }
    }

    /// Single-address prefix.
    pub fn host(addr: A) -> Self {
        Self { addr, len: A::BITS }
    }

    pub fn addr(&self) -> A {
        self.addr
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn contains(&self, addr: A) -> bool {
        addr.to_u128() & mask_bits::<A>(self.len) == self.addr.to_u128()
    }

    /// Address with only the host bits set (0.0.0.255 for a /24).
    pub fn host_mask(&self) -> A {
        A::from_u128(!mask_bits::<A>(self.len) & (u128::MAX >> (128 - A::BITS as u32)))
    }

    /// Highest address of the prefix (the directed broadcast for IPv4).
    pub fn directed_broadcast(&self) -> A {
        A::from_u128(self.addr.to_u128() | self.host_mask().to_u128())
    }
}

impl<A: IpAddress> fmt::Display for Prefix<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Splits `"addr/len"` into its parts; a missing length means a host prefix.
pub fn parse_cidr<A: IpAddress>(s: &str) -> Result<(A, u8)> {
    let (addr_str, len_str) = match s.split_once('/') {
        Some((a, l)) => (a, Some(l)),
        None => (s, None),
    };
    let addr: A = addr_str
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("invalid {} address: {}", A::FAMILY, addr_str)))?;
    let len = match len_str {
        Some(l) => l
            .trim()
            .parse::<u8>()
            .map_err(|_| Error::Parse(format!("invalid prefix length: {}", l)))?,
        None => A::BITS,
    };
    if len > A::BITS {
        return Err(Error::InvalidPrefix {
            addr: addr.to_string(),
            len,
        });
    }
    Ok((addr, len))
}

impl<A: IpAddress> FromStr for Prefix<A> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = parse_cidr::<A>(s)?;
        Prefix::new(addr, len)
    }
}

/// Family-independent view of an IP packet.
pub trait IpPacket: Sized + Send + fmt::Debug {
    type Addr: IpAddress;

    fn parse(data: &[u8]) -> Result<Self>;
    fn src_addr(&self) -> Self::Addr;
    fn dst_addr(&self) -> Self::Addr;
    fn as_bytes(&self) -> &[u8];
    fn into_bytes(self) -> Vec<u8>;

    /// True for ICMP error messages, which never trigger another error.
    fn is_icmp_error(&self) -> bool;
}

impl IpPacket for Ipv4Packet {
    type Addr = Ipv4Addr;

    fn parse(data: &[u8]) -> Result<Self> {
        Ipv4Packet::from_bytes(data)
    }

    fn src_addr(&self) -> Ipv4Addr {
        Ipv4Packet::src_addr(self)
    }

    fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Packet::dst_addr(self)
    }

    fn as_bytes(&self) -> &[u8] {
        Ipv4Packet::as_bytes(self)
    }

    fn into_bytes(self) -> Vec<u8> {
        Ipv4Packet::into_bytes(self)
    }

    fn is_icmp_error(&self) -> bool {
        self.protocol() == Protocol::Icmp as u8
            && matches!(self.payload().first(), Some(3 | 4 | 5 | 11 | 12))
    }
}

impl IpPacket for Ipv6Packet {
    type Addr = Ipv6Addr;

    fn parse(data: &[u8]) -> Result<Self> {
        Ipv6Packet::from_bytes(data)
    }

    fn src_addr(&self) -> Ipv6Addr {
        Ipv6Packet::src_addr(self)
    }

    fn dst_addr(&self) -> Ipv6Addr {
        Ipv6Packet::dst_addr(self)
    }

    fn as_bytes(&self) -> &[u8] {
        Ipv6Packet::as_bytes(self)
    }

    fn into_bytes(self) -> Vec<u8> {
        Ipv6Packet::into_bytes(self)
    }

    fn is_icmp_error(&self) -> bool {
        self.upper_protocol() == Protocol::Icmpv6 as u8
            && matches!(self.upper_payload().first(), Some(t) if Icmpv6Type::is_error(*t))
    }
}
