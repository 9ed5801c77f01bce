//! UDP protocol - RFC 768
//!
//! Only what the network layer needs: ports and checksum fix-ups after
//! address translation.

use crate::{Error, Result};
use std::net::Ipv4Addr;

/// UDP header size
pub const HEADER_SIZE: usize = 8;

/// UDP protocol number for pseudo-header
pub const PROTOCOL_NUMBER: u8 = 17;

/// Owned UDP datagram whose ports can be rewritten.
#[derive(Debug, Clone)]
pub struct UdpPacket {
    buffer: Vec<u8>,
}

impl UdpPacket {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP datagram too short".into()));
        }

        Ok(Self {
            buffer: data.to_vec(),
        })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Set source port (checksum must be updated separately)
    pub fn set_src_port(&mut self, port: u16) {
        self.buffer[0..2].copy_from_slice(&port.to_be_bytes());
    }

    /// Set destination port (checksum must be updated separately)
    pub fn set_dst_port(&mut self, port: u16) {
        self.buffer[2..4].copy_from_slice(&port.to_be_bytes());
    }

    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    /// Recompute the checksum for the given addresses. A datagram sent
    /// without a checksum (zero) is left without one.
    pub fn update_checksum(&mut self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) {
        if self.checksum() == 0 {
            return;
        }
        self.buffer[6] = 0;
        self.buffer[7] = 0;

        let sum = udp_checksum(src_ip, dst_ip, &self.buffer);
        // 0 is reserved for "no checksum"
        let sum = if sum == 0 { 0xFFFF } else { sum };
        self.buffer[6..8].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// UDP packet builder for creating new UDP datagrams
#[derive(Debug, Clone, Default)]
pub struct UdpBuilder {
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
}

impl UdpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    /// Build the UDP datagram with checksum
    pub fn build(self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let length = (HEADER_SIZE + self.payload.len()) as u16;
        let mut buffer = Vec::with_capacity(length as usize);
        buffer.extend_from_slice(&self.src_port.to_be_bytes());
        buffer.extend_from_slice(&self.dst_port.to_be_bytes());
        buffer.extend_from_slice(&length.to_be_bytes());
        buffer.extend_from_slice(&[0, 0]);
        buffer.extend_from_slice(&self.payload);

        let sum = udp_checksum(src_ip, dst_ip, &buffer);
        let sum = if sum == 0 { 0xFFFF } else { sum };
        buffer[6..8].copy_from_slice(&sum.to_be_bytes());

        buffer
    }
}

/// Internet checksum over an IPv4 pseudo-header and a transport segment.
pub fn pseudo_header_checksum(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut sum: u32 = 0;

    for chunk in src_ip.octets().chunks(2).chain(dst_ip.octets().chunks(2)) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    sum += protocol as u32;
    sum += segment.len() as u32;

    for chunk in segment.chunks(2) {
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

/// Calculate UDP checksum with pseudo-header (RFC 768)
pub fn udp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, udp_datagram: &[u8]) -> u16 {
    pseudo_header_checksum(src_ip, dst_ip, PROTOCOL_NUMBER, udp_datagram)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const DST: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    #[test]
    fn test_builder_and_parse() {
        let data = UdpBuilder::new()
            .src_port(5000)
            .dst_port(53)
            .payload(b"query")
            .build(SRC, DST);
        let udp = UdpPacket::from_bytes(&data).unwrap();
        assert_eq!(udp.src_port(), 5000);
        assert_eq!(udp.dst_port(), 53);
        assert_eq!(udp.payload(), b"query");
        assert_eq!(udp_checksum(SRC, DST, &data), 0);
    }

    #[test]
    fn test_rewrite_keeps_checksum_valid() {
        let data = UdpBuilder::new()
            .src_port(5000)
            .dst_port(53)
            .payload(b"abc")
            .build(SRC, DST);
        let mut udp = UdpPacket::from_bytes(&data).unwrap();
        let ext = Ipv4Addr::new(1, 2, 3, 4);
        udp.set_src_port(6200);
        udp.update_checksum(ext, DST);
        assert_eq!(udp_checksum(ext, DST, udp.as_bytes()), 0);
    }

    #[test]
    fn test_zero_checksum_preserved() {
        let mut data = UdpBuilder::new().src_port(1).dst_port(2).build(SRC, DST);
        data[6] = 0;
        data[7] = 0;
        let mut udp = UdpPacket::from_bytes(&data).unwrap();
        udp.set_dst_port(99);
        udp.update_checksum(SRC, DST);
        assert_eq!(udp.checksum(), 0);
    }

    #[test]
    fn test_too_short() {
        assert!(UdpPacket::from_bytes(&[0u8; 7]).is_err());
    }
}
