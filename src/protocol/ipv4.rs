//! IPv4 protocol - RFC 791

use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// Default TTL for locally originated packets
pub const DEFAULT_TTL: u8 = 64;

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
    Icmpv6 = 58,
}

impl Protocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Protocol::Icmp),
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            58 => Some(Protocol::Icmpv6),
            _ => None,
        }
    }
}

/// Calculate IPv4 header checksum
pub fn checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    for chunk in header.chunks(2) {
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

    !(sum as u16)
}

/// Owned IPv4 packet that can be rewritten in place (TTL, addresses).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    buffer: Vec<u8>,
    header_len: usize,
}

impl Ipv4Packet {
    /// Create from raw bytes (copies the data).
    ///
    /// Trailing link-layer padding beyond the total length field is dropped.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("IPv4 packet too short".into()));
        }

        if data[0] >> 4 != 4 {
            return Err(Error::InvalidPacket("not an IPv4 packet".into()));
        }

        let header_len = ((data[0] & 0x0F) as usize) * 4;
        if header_len < MIN_HEADER_SIZE || data.len() < header_len {
            return Err(Error::Parse("IPv4 header truncated".into()));
        }

        let total_length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_length < header_len || total_length > data.len() {
            return Err(Error::Parse(format!(
                "IPv4 total length {} does not fit buffer of {}",
                total_length,
                data.len()
            )));
        }

        Ok(Self {
            buffer: data[..total_length].to_vec(),
            header_len,
        })
    }

    pub fn ttl(&self) -> u8 {
        self.buffer[8]
    }

    /// Decrement TTL and update checksum.
    /// Returns false if TTL would become 0 (packet should be dropped).
    pub fn decrement_ttl(&mut self) -> bool {
        if self.buffer[8] <= 1 {
            return false;
        }

        self.buffer[8] -= 1;
        self.update_checksum();
        true
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        self.buffer[8] = ttl;
        self.update_checksum();
    }

    /// Recalculate and update header checksum
    pub fn update_checksum(&mut self) {
        self.buffer[10] = 0;
        self.buffer[11] = 0;

        let sum = checksum(&self.buffer[..self.header_len]);
        self.buffer[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn validate_checksum(&self) -> bool {
        checksum(&self.buffer[..self.header_len]) == 0
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[12],
            self.buffer[13],
            self.buffer[14],
            self.buffer[15],
        )
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(
            self.buffer[16],
            self.buffer[17],
            self.buffer[18],
            self.buffer[19],
        )
    }

    /// Rewrite the source address. The header checksum is updated; transport
    /// checksums are the caller's concern.
    pub fn set_src_addr(&mut self, addr: Ipv4Addr) {
        self.buffer[12..16].copy_from_slice(&addr.octets());
        self.update_checksum();
    }

    /// Rewrite the destination address and update the header checksum.
    pub fn set_dst_addr(&mut self, addr: Ipv4Addr) {
        self.buffer[16..20].copy_from_slice(&addr.octets());
        self.update_checksum();
    }

    pub fn protocol(&self) -> u8 {
        self.buffer[9]
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Header bytes including options
    pub fn header(&self) -> &[u8] {
        &self.buffer[..self.header_len]
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.header_len..]
    }

    /// Replace the payload, fixing up total length and checksum.
    pub fn set_payload(&mut self, payload: &[u8]) {
        self.buffer.truncate(self.header_len);
        self.buffer.extend_from_slice(payload);
        let total = self.buffer.len() as u16;
        self.buffer[2..4].copy_from_slice(&total.to_be_bytes());
        self.update_checksum();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Builder for constructing IPv4 packets
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    identification: u16,
    dont_fragment: bool,
    ttl: u8,
    protocol: u8,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    payload: Vec<u8>,
}

impl Ipv4Builder {
    pub fn new() -> Self {
        Self {
            identification: 0,
            dont_fragment: true,
            ttl: DEFAULT_TTL,
            protocol: 0,
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            payload: Vec::new(),
        }
    }

    pub fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    pub fn dont_fragment(mut self, df: bool) -> Self {
        self.dont_fragment = df;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn src_addr(mut self, addr: Ipv4Addr) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn dst_addr(mut self, addr: Ipv4Addr) -> Self {
        self.dst_addr = addr;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total_length = (MIN_HEADER_SIZE + self.payload.len()) as u16;
        let mut buffer = vec![0u8; MIN_HEADER_SIZE];

        // Version (4) + IHL (5 = 20 bytes, no options)
        buffer[0] = 0x45;
        buffer[2..4].copy_from_slice(&total_length.to_be_bytes());
        buffer[4..6].copy_from_slice(&self.identification.to_be_bytes());
        if self.dont_fragment {
            buffer[6] = 0x40;
        }
        buffer[8] = self.ttl;
        buffer[9] = self.protocol;
        buffer[12..16].copy_from_slice(&self.src_addr.octets());
        buffer[16..20].copy_from_slice(&self.dst_addr.octets());

        let sum = checksum(&buffer);
        buffer[10..12].copy_from_slice(&sum.to_be_bytes());

        buffer.extend_from_slice(&self.payload);
        buffer
    }

    /// Build straight into an owned packet.
    pub fn build_packet(self) -> Ipv4Packet {
        let buffer = self.build();
        Ipv4Packet {
            buffer,
            header_len: MIN_HEADER_SIZE,
        }
    }
}

impl Default for Ipv4Builder {
    fn default() -> Self {
        Self::new()
    }
}
