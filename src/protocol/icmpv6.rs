//! ICMPv6 protocol - RFC 4443, NDP - RFC 4861

use super::ipv6::Ipv6Builder;
use super::MacAddr;
use crate::{Error, Result};
use std::net::Ipv6Addr;

/// Minimum ICMPv6 header size
pub const MIN_HEADER_SIZE: usize = 4;

/// Neighbor Solicitation/Advertisement message size (without options)
pub const NDP_MSG_SIZE: usize = 24; // 4 (header) + 4 (reserved/flags) + 16 (target)

/// Hop limit required on Neighbor Discovery messages
pub const NDP_HOP_LIMIT: u8 = 255;

/// Error messages quote the invoking packet up to the minimum MTU
const MAX_ERROR_QUOTE: usize = 1280 - 40 - 8;

const NEXT_HEADER_ICMPV6: u8 = 58;

/// ICMPv6 message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Icmpv6Type {
    DestinationUnreachable = 1,
    PacketTooBig = 2,
    TimeExceeded = 3,
    ParameterProblem = 4,
    EchoRequest = 128,
    EchoReply = 129,
    NeighborSolicitation = 135,
    NeighborAdvertisement = 136,
}

impl Icmpv6Type {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Icmpv6Type::DestinationUnreachable),
            2 => Some(Icmpv6Type::PacketTooBig),
            3 => Some(Icmpv6Type::TimeExceeded),
            4 => Some(Icmpv6Type::ParameterProblem),
            128 => Some(Icmpv6Type::EchoRequest),
            129 => Some(Icmpv6Type::EchoReply),
            135 => Some(Icmpv6Type::NeighborSolicitation),
            136 => Some(Icmpv6Type::NeighborAdvertisement),
            _ => None,
        }
    }

    /// Types 0-127 are error messages
    pub fn is_error(value: u8) -> bool {
        value < 128
    }
}

/// Destination Unreachable codes (RFC 4443)
pub mod dest_unreachable {
    pub const NO_ROUTE: u8 = 0;
    pub const ADMIN_PROHIBITED: u8 = 1;
    pub const ADDRESS_UNREACHABLE: u8 = 3;
    pub const PORT_UNREACHABLE: u8 = 4;
}

/// Time Exceeded codes (RFC 4443)
pub mod time_exceeded {
    pub const HOP_LIMIT_EXCEEDED: u8 = 0;
}

/// NDP option types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NdpOptionType {
    SourceLinkLayerAddress = 1,
    TargetLinkLayerAddress = 2,
}

/// Parsed ICMPv6 message (zero-copy reference)
#[derive(Debug)]
pub struct Icmpv6Packet<'a> {
    buffer: &'a [u8],
}

impl<'a> Icmpv6Packet<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("ICMPv6 packet too short".into()));
        }

        Ok(Self { buffer })
    }

    pub fn msg_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Message body (after type, code and checksum)
    pub fn body(&self) -> &[u8] {
        &self.buffer[MIN_HEADER_SIZE..]
    }

    pub fn is_echo_request(&self) -> bool {
        self.msg_type() == Icmpv6Type::EchoRequest as u8
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer
    }
}

/// Neighbor Solicitation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSolicitation {
    pub target_addr: Ipv6Addr,
    pub source_link_addr: Option<MacAddr>,
}

impl NeighborSolicitation {
    pub fn new(target_addr: Ipv6Addr, source_link_addr: Option<MacAddr>) -> Self {
        Self {
            target_addr,
            source_link_addr,
        }
    }

    /// Parse from ICMPv6 body (after type/code/checksum)
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 20 {
            return Err(Error::Parse("Neighbor Solicitation too short".into()));
        }

        Ok(Self {
            target_addr: read_addr(&body[4..20]),
            source_link_addr: parse_link_layer_option(
                &body[20..],
                NdpOptionType::SourceLinkLayerAddress,
            ),
        })
    }

    /// Build NS message bytes (ICMPv6 message without IPv6 header, checksum zero)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NDP_MSG_SIZE];
        buf[0] = Icmpv6Type::NeighborSolicitation as u8;
        buf[8..24].copy_from_slice(&self.target_addr.octets());

        if let Some(mac) = &self.source_link_addr {
            push_link_layer_option(&mut buf, NdpOptionType::SourceLinkLayerAddress, mac);
        }
        buf
    }
}

/// Neighbor Advertisement message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborAdvertisement {
    pub router_flag: bool,
    pub solicited_flag: bool,
    pub override_flag: bool,
    pub target_addr: Ipv6Addr,
    pub target_link_addr: Option<MacAddr>,
}

impl NeighborAdvertisement {
    /// Solicited NA for one of our addresses (S=1, O=1, R=0)
    pub fn solicited_reply(target_addr: Ipv6Addr, target_link_addr: MacAddr) -> Self {
        Self {
            router_flag: false,
            solicited_flag: true,
            override_flag: true,
            target_addr,
            target_link_addr: Some(target_link_addr),
        }
    }

    /// Parse from ICMPv6 body (after type/code/checksum)
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 20 {
            return Err(Error::Parse("Neighbor Advertisement too short".into()));
        }

        let flags = body[0];
        Ok(Self {
            router_flag: flags & 0x80 != 0,
            solicited_flag: flags & 0x40 != 0,
            override_flag: flags & 0x20 != 0,
            target_addr: read_addr(&body[4..20]),
            target_link_addr: parse_link_layer_option(
                &body[20..],
                NdpOptionType::TargetLinkLayerAddress,
            ),
        })
    }

    /// Build NA message bytes (ICMPv6 message without IPv6 header, checksum zero)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NDP_MSG_SIZE];
        buf[0] = Icmpv6Type::NeighborAdvertisement as u8;

        let mut flags: u8 = 0;
        if self.router_flag {
            flags |= 0x80;
        }
        if self.solicited_flag {
            flags |= 0x40;
        }
        if self.override_flag {
            flags |= 0x20;
        }
        buf[4] = flags;
        buf[8..24].copy_from_slice(&self.target_addr.octets());

        if let Some(mac) = &self.target_link_addr {
            push_link_layer_option(&mut buf, NdpOptionType::TargetLinkLayerAddress, mac);
        }
        buf
    }
}

fn read_addr(bytes: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&bytes[..16]);
    Ipv6Addr::from(octets)
}

fn push_link_layer_option(buf: &mut Vec<u8>, kind: NdpOptionType, mac: &MacAddr) {
    buf.push(kind as u8);
    buf.push(1); // Length in units of 8 bytes
    buf.extend_from_slice(&mac.0);
}

/// Parse link-layer address option from NDP options
fn parse_link_layer_option(options: &[u8], expected_type: NdpOptionType) -> Option<MacAddr> {
    let mut offset = 0;
    while offset + 2 <= options.len() {
        let opt_type = options[offset];
        let opt_len = options[offset + 1] as usize * 8;

        if opt_len == 0 || offset + opt_len > options.len() {
            break;
        }

        if opt_type == expected_type as u8 && opt_len >= 8 {
            let mac_bytes: [u8; 6] = options[offset + 2..offset + 8].try_into().ok()?;
            return Some(MacAddr(mac_bytes));
        }

        offset += opt_len;
    }
    None
}

fn pseudo_header_sum(src_addr: &Ipv6Addr, dst_addr: &Ipv6Addr, len: usize) -> u32 {
    let mut sum: u32 = 0;
    for chunk in src_addr.octets().chunks(2).chain(dst_addr.octets().chunks(2)) {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    let length = len as u32;
    sum = sum.wrapping_add(length >> 16);
    sum = sum.wrapping_add(length & 0xFFFF);
    sum.wrapping_add(NEXT_HEADER_ICMPV6 as u32)
}

fn fold(mut sum: u32, data: &[u8], skip_checksum: bool) -> u16 {
    for (i, chunk) in data.chunks(2).enumerate() {
        if skip_checksum && i == 1 {
            continue;
        }
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum = sum.wrapping_add(word as u32);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Calculate ICMPv6 checksum with IPv6 pseudo-header.
/// The checksum field (bytes 2-3) is treated as zero.
pub fn calculate_checksum(src_addr: &Ipv6Addr, dst_addr: &Ipv6Addr, icmpv6_data: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src_addr, dst_addr, icmpv6_data.len());
    !fold(sum, icmpv6_data, true)
}

/// Set checksum in ICMPv6 message buffer
pub fn set_checksum(buffer: &mut [u8], src_addr: &Ipv6Addr, dst_addr: &Ipv6Addr) {
    let checksum = calculate_checksum(src_addr, dst_addr, buffer);
    buffer[2..4].copy_from_slice(&checksum.to_be_bytes());
}

pub fn validate_checksum(src_addr: &Ipv6Addr, dst_addr: &Ipv6Addr, icmpv6_data: &[u8]) -> bool {
    let sum = pseudo_header_sum(src_addr, dst_addr, icmpv6_data.len());
    fold(sum, icmpv6_data, false) == 0xFFFF
}

/// Echo Reply message for an Echo Request message (checksum zero)
pub fn build_echo_reply(request: &[u8]) -> Result<Vec<u8>> {
    if request.len() < 8 {
        return Err(Error::Parse("ICMPv6 echo request too short".into()));
    }
    let mut reply = request.to_vec();
    reply[0] = Icmpv6Type::EchoReply as u8;
    reply[2] = 0;
    reply[3] = 0;
    Ok(reply)
}

/// Error message quoting as much of the invoking packet as fits (checksum zero)
pub fn build_error(msg_type: Icmpv6Type, code: u8, invoking_packet: &[u8]) -> Vec<u8> {
    let quote = invoking_packet.len().min(MAX_ERROR_QUOTE);
    let mut buf = vec![msg_type as u8, code, 0, 0, 0, 0, 0, 0];
    buf.extend_from_slice(&invoking_packet[..quote]);
    buf
}

/// Wrap an ICMPv6 message in an IPv6 header, filling in the checksum.
pub fn encapsulate(
    src_addr: Ipv6Addr,
    dst_addr: Ipv6Addr,
    hop_limit: u8,
    mut message: Vec<u8>,
) -> Vec<u8> {
    set_checksum(&mut message, &src_addr, &dst_addr);
    Ipv6Builder::new()
        .src_addr(src_addr)
        .dst_addr(dst_addr)
        .hop_limit(hop_limit)
        .next_header(NEXT_HEADER_ICMPV6)
        .payload(&message)
        .build()
}
