//! TCP protocol - RFC 793
//!
//! Port access and checksum fix-ups for address translation.

use super::udp::pseudo_header_checksum;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Minimum TCP header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// TCP protocol number for pseudo-header
pub const PROTOCOL_NUMBER: u8 = 6;

pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const ACK: u8 = 0x10;
}

/// Owned TCP segment whose ports can be rewritten.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    buffer: Vec<u8>,
}

impl TcpPacket {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP segment too short".into()));
        }

        let header_len = ((data[12] >> 4) as usize) * 4;
        if header_len < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP data offset too small".into()));
        }
        if data.len() < header_len {
            return Err(Error::Parse("TCP header truncated".into()));
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

    /// Raw flags byte
    pub fn flags(&self) -> u8 {
        self.buffer[13]
    }

    pub fn update_checksum(&mut self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) {
        self.buffer[16] = 0;
        self.buffer[17] = 0;

        let sum = tcp_checksum(src_ip, dst_ip, &self.buffer);
        self.buffer[16..18].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Builder for minimal TCP segments (no options)
#[derive(Debug, Clone, Default)]
pub struct TcpBuilder {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: Vec<u8>,
}

impl TcpBuilder {
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

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    pub fn build(self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(MIN_HEADER_SIZE + self.payload.len());
        buffer.extend_from_slice(&self.src_port.to_be_bytes());
        buffer.extend_from_slice(&self.dst_port.to_be_bytes());
        buffer.extend_from_slice(&self.seq.to_be_bytes());
        buffer.extend_from_slice(&self.ack.to_be_bytes());
        buffer.push(0x50); // data offset 5
        buffer.push(self.flags);
        buffer.extend_from_slice(&65535u16.to_be_bytes());
        buffer.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
        buffer.extend_from_slice(&self.payload);

        let sum = tcp_checksum(src_ip, dst_ip, &buffer);
        buffer[16..18].copy_from_slice(&sum.to_be_bytes());
        buffer
    }
}

/// Calculate TCP checksum with pseudo-header (RFC 793)
pub fn tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_segment: &[u8]) -> u16 {
    pseudo_header_checksum(src_ip, dst_ip, PROTOCOL_NUMBER, tcp_segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const DST: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    #[test]
    fn test_builder_and_parse() {
        let data = TcpBuilder::new()
            .src_port(40000)
            .dst_port(80)
            .seq(1)
            .flags(flags::SYN)
            .build(SRC, DST);
        let tcp = TcpPacket::from_bytes(&data).unwrap();
        assert_eq!(tcp.src_port(), 40000);
        assert_eq!(tcp.dst_port(), 80);
        assert_eq!(tcp.flags(), flags::SYN);
        assert_eq!(tcp_checksum(SRC, DST, &data), 0);
    }

    #[test]
    fn test_rewrite_keeps_checksum_valid() {
        let data = TcpBuilder::new()
            .src_port(40000)
            .dst_port(80)
            .flags(flags::ACK)
            .payload(b"GET /")
            .build(SRC, DST);
        let mut tcp = TcpPacket::from_bytes(&data).unwrap();
        let ext = Ipv4Addr::new(203, 0, 113, 1);
        tcp.set_src_port(6201);
        tcp.update_checksum(ext, DST);
        assert_eq!(tcp_checksum(ext, DST, tcp.as_bytes()), 0);
    }

    #[test]
    fn test_bad_data_offset() {
        let mut data = TcpBuilder::new().build(SRC, DST);
        data[12] = 0x40;
        assert!(TcpPacket::from_bytes(&data).is_err());
        data[12] = 0xf0;
        assert!(TcpPacket::from_bytes(&data).is_err());
    }
}
