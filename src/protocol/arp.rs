//! ARP (Address Resolution Protocol) - RFC 826

use super::MacAddr;
use crate::{Error, Result};
use std::net::Ipv4Addr;

/// ARP packet size (for Ethernet/IPv4)
pub const ARP_PACKET_SIZE: usize = 28;

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;

/// ARP operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOp {
    Request = 1,
    Reply = 2,
}

impl ArpOp {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }
}

/// ARP packet (Ethernet/IPv4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOp,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

fn mac_at(buffer: &[u8], offset: usize) -> MacAddr {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&buffer[offset..offset + 6]);
    MacAddr(mac)
}

fn ip_at(buffer: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buffer[offset],
        buffer[offset + 1],
        buffer[offset + 2],
        buffer[offset + 3],
    )
}

impl ArpPacket {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < ARP_PACKET_SIZE {
            return Err(Error::Parse("ARP packet too short".into()));
        }

        if u16::from_be_bytes([buffer[0], buffer[1]]) != HTYPE_ETHERNET {
            return Err(Error::Parse("unsupported hardware type".into()));
        }
        if u16::from_be_bytes([buffer[2], buffer[3]]) != PTYPE_IPV4 {
            return Err(Error::Parse("unsupported protocol type".into()));
        }
        if buffer[4] != 6 || buffer[5] != 4 {
            return Err(Error::Parse("invalid ARP address lengths".into()));
        }

        let operation = ArpOp::from_u16(u16::from_be_bytes([buffer[6], buffer[7]]))
            .ok_or_else(|| Error::Parse("invalid ARP operation".into()))?;

        Ok(Self {
            operation,
            sender_mac: mac_at(buffer, 8),
            sender_ip: ip_at(buffer, 14),
            target_mac: mac_at(buffer, 18),
            target_ip: ip_at(buffer, 24),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_SIZE] {
        let mut buf = [0u8; ARP_PACKET_SIZE];
        buf[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        buf[2..4].copy_from_slice(&PTYPE_IPV4.to_be_bytes());
        buf[4] = 6;
        buf[5] = 4;
        buf[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        buf[8..14].copy_from_slice(&self.sender_mac.0);
        buf[14..18].copy_from_slice(&self.sender_ip.octets());
        buf[18..24].copy_from_slice(&self.target_mac.0);
        buf[24..28].copy_from_slice(&self.target_ip.octets());
        buf
    }

    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    pub fn reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            operation: ArpOp::Reply,
            sender_mac,
            sender_ip,
            target_mac,
            target_ip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: MacAddr = MacAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const MAC_B: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

    #[test]
    fn test_request_wire_format() {
        let req = ArpPacket::request(MAC_A, Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2));
        let bytes = req.to_bytes();
        assert_eq!(&bytes[0..8], &[0, 1, 0x08, 0x00, 6, 4, 0, 1]);
        assert_eq!(&bytes[8..14], &MAC_A.0);
        assert_eq!(&bytes[24..28], &[192, 168, 1, 2]);

        let parsed = ArpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(parsed.target_mac, MacAddr::ZERO);
    }

    #[test]
    fn test_reply_parse() {
        let reply = ArpPacket::reply(
            MAC_B,
            Ipv4Addr::new(192, 168, 1, 2),
            MAC_A,
            Ipv4Addr::new(192, 168, 1, 1),
        );
        let parsed = ArpPacket::parse(&reply.to_bytes()).unwrap();
        assert_eq!(parsed.operation, ArpOp::Reply);
        assert_eq!(parsed.sender_mac, MAC_B);
        assert_eq!(parsed.target_ip, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_parse_rejects_bad_headers() {
        let good = ArpPacket::request(MAC_A, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
            .to_bytes();

        assert!(ArpPacket::parse(&good[..27]).is_err());

        let mut bad = good;
        bad[1] = 6;
        assert!(ArpPacket::parse(&bad).is_err());

        let mut bad = good;
        bad[3] = 0xdd;
        assert!(ArpPacket::parse(&bad).is_err());

        let mut bad = good;
        bad[7] = 9;
        assert!(ArpPacket::parse(&bad).is_err());
    }
}
