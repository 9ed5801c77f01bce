//! ICMP (Internet Control Message Protocol) - RFC 792

use crate::{Error, Result};

/// ICMP header size (minimum)
pub const ICMP_HEADER_SIZE: usize = 8;

/// ICMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IcmpType {
    EchoReply = 0,
    DestinationUnreachable = 3,
    EchoRequest = 8,
    TimeExceeded = 11,
}

impl IcmpType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(IcmpType::EchoReply),
            3 => Some(IcmpType::DestinationUnreachable),
            8 => Some(IcmpType::EchoRequest),
            11 => Some(IcmpType::TimeExceeded),
            _ => None,
        }
    }
}

/// Destination Unreachable codes (RFC 792)
pub mod dest_unreachable {
    pub const NET_UNREACHABLE: u8 = 0;
    pub const HOST_UNREACHABLE: u8 = 1;
    pub const PROTOCOL_UNREACHABLE: u8 = 2;
    pub const PORT_UNREACHABLE: u8 = 3;
}

/// Time Exceeded codes (RFC 792)
pub mod time_exceeded {
    pub const TTL_EXCEEDED: u8 = 0;
    pub const FRAGMENT_REASSEMBLY: u8 = 1;
}

/// Parsed ICMP message
#[derive(Debug)]
pub struct IcmpPacket<'a> {
    buffer: &'a [u8],
}

impl<'a> IcmpPacket<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < ICMP_HEADER_SIZE {
            return Err(Error::Parse("ICMP packet too short".into()));
        }

        Ok(Self { buffer })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    /// For Echo Request/Reply: identifier
    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// For Echo Request/Reply: sequence number
    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[ICMP_HEADER_SIZE..]
    }

    pub fn validate_checksum(&self) -> bool {
        icmp_checksum(self.buffer) == 0
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type() == IcmpType::EchoRequest as u8
    }

    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type() == IcmpType::EchoReply as u8
    }
}

/// Build an ICMP Echo Reply from an Echo Request
pub fn build_echo_reply(request: &[u8]) -> Result<Vec<u8>> {
    if request.len() < ICMP_HEADER_SIZE {
        return Err(Error::Parse("ICMP request too short".into()));
    }

    let mut reply = request.to_vec();
    reply[0] = IcmpType::EchoReply as u8;
    reply[2] = 0;
    reply[3] = 0;

    let checksum = icmp_checksum(&reply);
    reply[2..4].copy_from_slice(&checksum.to_be_bytes());

    Ok(reply)
}

/// Calculate ICMP checksum
pub fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    for chunk in data.chunks(2) {
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

/// Build an ICMP error message quoting the offending datagram.
///
/// `original_header` is the full IP header of the datagram that caused the
/// error; only the first 8 bytes of `original_payload` are quoted.
pub fn build_error(
    icmp_type: IcmpType,
    code: u8,
    original_header: &[u8],
    original_payload: &[u8],
) -> Vec<u8> {
    let payload_len = original_payload.len().min(8);
    let mut packet = Vec::with_capacity(ICMP_HEADER_SIZE + original_header.len() + payload_len);

    packet.extend_from_slice(&[icmp_type as u8, code, 0, 0, 0, 0, 0, 0]);
    packet.extend_from_slice(original_header);
    packet.extend_from_slice(&original_payload[..payload_len]);

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build a Destination Unreachable message
pub fn build_destination_unreachable(
    code: u8,
    original_header: &[u8],
    original_payload: &[u8],
) -> Vec<u8> {
    build_error(
        IcmpType::DestinationUnreachable,
        code,
        original_header,
        original_payload,
    )
}

/// Build a Time Exceeded message
pub fn build_time_exceeded(code: u8, original_header: &[u8], original_payload: &[u8]) -> Vec<u8> {
    build_error(
        IcmpType::TimeExceeded,
        code,
        original_header,
        original_payload,
    )
}

/// Owned ICMP message whose echo identifier can be rewritten (NAT).
#[derive(Debug, Clone)]
pub struct IcmpMutablePacket {
    buffer: Vec<u8>,
}

impl IcmpMutablePacket {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ICMP_HEADER_SIZE {
            return Err(Error::Parse("ICMP packet too short".into()));
        }

        Ok(Self {
            buffer: data.to_vec(),
        })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// Set identifier and update checksum
    pub fn set_identifier(&mut self, id: u16) {
        self.buffer[4..6].copy_from_slice(&id.to_be_bytes());
        self.update_checksum();
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    pub fn update_checksum(&mut self) {
        self.buffer[2] = 0;
        self.buffer[3] = 0;

        let sum = icmp_checksum(&self.buffer);
        self.buffer[2..4].copy_from_slice(&sum.to_be_bytes());
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type() == IcmpType::EchoRequest as u8
    }

    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type() == IcmpType::EchoReply as u8
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn validate_checksum(&self) -> bool {
        icmp_checksum(&self.buffer) == 0
    }
}

/// Builder for ICMP Echo Request packets
#[derive(Debug, Clone)]
pub struct EchoRequestBuilder {
    identifier: u16,
    sequence: u16,
    payload: Vec<u8>,
}

impl EchoRequestBuilder {
    pub fn new(identifier: u16, sequence: u16) -> Self {
        Self {
            identifier,
            sequence,
            payload: Vec::new(),
        }
    }

    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut packet = vec![IcmpType::EchoRequest as u8, 0, 0, 0];
        packet.extend_from_slice(&self.identifier.to_be_bytes());
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.payload);

        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());

        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_request_builder() {
        let pkt = EchoRequestBuilder::new(0x1234, 7).payload(b"ping").build();
        let icmp = IcmpPacket::parse(&pkt).unwrap();
        assert!(icmp.is_echo_request());
        assert_eq!(icmp.identifier(), 0x1234);
        assert_eq!(icmp.sequence(), 7);
        assert_eq!(icmp.payload(), b"ping");
        assert!(icmp.validate_checksum());
    }

    #[test]
    fn test_build_echo_reply() {
        let request = EchoRequestBuilder::new(1, 2).payload(&[9; 16]).build();
        let reply = build_echo_reply(&request).unwrap();
        let icmp = IcmpPacket::parse(&reply).unwrap();
        assert!(icmp.is_echo_reply());
        assert_eq!(icmp.identifier(), 1);
        assert_eq!(icmp.sequence(), 2);
        assert_eq!(icmp.payload(), &[9; 16]);
        assert!(icmp.validate_checksum());

        assert!(build_echo_reply(&[8, 0, 0]).is_err());
    }

    #[test]
    fn test_build_time_exceeded_quotes_eight_bytes() {
        let header = [0x45u8; 20];
        let payload = [1u8; 32];
        let msg = build_time_exceeded(time_exceeded::TTL_EXCEEDED, &header, &payload);
        assert_eq!(msg.len(), 8 + 20 + 8);
        assert_eq!(msg[0], IcmpType::TimeExceeded as u8);
        assert_eq!(msg[1], 0);
        assert_eq!(icmp_checksum(&msg), 0);
    }

    #[test]
    fn test_build_destination_unreachable_short_payload() {
        let header = [0x45u8; 20];
        let msg = build_destination_unreachable(
            dest_unreachable::PROTOCOL_UNREACHABLE,
            &header,
            &[1, 2, 3],
        );
        assert_eq!(msg.len(), 8 + 20 + 3);
        assert_eq!(msg[0], 3);
        assert_eq!(msg[1], 2);
        assert_eq!(icmp_checksum(&msg), 0);
    }

    #[test]
    fn test_mutable_set_identifier() {
        let request = EchoRequestBuilder::new(100, 1).build();
        let mut icmp = IcmpMutablePacket::from_bytes(&request).unwrap();
        icmp.set_identifier(6200);
        assert_eq!(icmp.identifier(), 6200);
        assert_eq!(icmp.sequence(), 1);
        assert!(icmp.validate_checksum());
        assert!(icmp.is_echo_request());
        assert!(IcmpMutablePacket::from_bytes(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_icmp_type_from_u8() {
        assert_eq!(IcmpType::from_u8(0), Some(IcmpType::EchoReply));
        assert_eq!(IcmpType::from_u8(11), Some(IcmpType::TimeExceeded));
        assert_eq!(IcmpType::from_u8(42), None);
    }
}
