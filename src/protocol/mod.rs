//! Wire formats
//!
//! Ethernet, ARP, IPv4/IPv6 (with extension headers), ICMP/ICMPv6 and the
//! parts of UDP/TCP that address translation touches.

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod icmpv6;
pub mod ip;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod types;
pub mod udp;

pub use ip::{IpAddress, IpPacket, Prefix};
pub use types::*;
