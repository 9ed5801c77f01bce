//! IPv6 protocol - RFC 8200, Segment Routing Header - RFC 8754

use crate::{Error, Result};
use std::net::Ipv6Addr;

/// IPv6 header size (fixed, unlike IPv4)
pub const HEADER_SIZE: usize = 40;

/// Default hop limit for locally originated packets
pub const DEFAULT_HOP_LIMIT: u8 = 64;

/// ff01::1
pub const ALL_NODES_INTERFACE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff01, 0, 0, 0, 0, 0, 0, 1);
/// ff02::1
pub const ALL_NODES_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Next header values for the extension headers this stack walks
pub mod ext {
    pub const HOP_BY_HOP: u8 = 0;
    pub const ROUTING: u8 = 43;
    pub const FRAGMENT: u8 = 44;
    pub const DEST_OPTIONS: u8 = 60;
    pub const NO_NEXT_HEADER: u8 = 59;
}

/// Routing header type carrying a segment list
pub const ROUTING_TYPE_SRH: u8 = 4;

/// Clean-up flag in the SRH flags byte
pub const SRH_FLAG_CLEANUP: u8 = 0x80;

const FRAGMENT_HEADER_SIZE: usize = 8;
const SRH_FIXED_SIZE: usize = 8;

pub fn is_extension_header(next_header: u8) -> bool {
    matches!(
        next_header,
        ext::HOP_BY_HOP | ext::ROUTING | ext::FRAGMENT | ext::DEST_OPTIONS
    )
}

/// Solicited-node multicast address (ff02::1:ffXX:XXXX) for `addr`.
pub fn solicited_node_multicast(addr: Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | o[13] as u16,
        u16::from_be_bytes([o[14], o[15]]),
    )
}

/// Position of one extension header inside the packet buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtHeader {
    /// Next header value that identified this header
    pub kind: u8,
    pub offset: usize,
    pub len: usize,
    /// Offset of the byte holding `kind` (6 for the fixed header)
    pub kind_offset: usize,
}

fn walk_ext_headers(buffer: &[u8]) -> Result<(Vec<ExtHeader>, u8, usize)> {
    let mut headers = Vec::new();
    let mut kind = buffer[6];
    let mut kind_offset = 6;
    let mut offset = HEADER_SIZE;

    while is_extension_header(kind) {
        if buffer.len() < offset + 2 {
            return Err(Error::Parse("IPv6 extension header truncated".into()));
        }
        let len = if kind == ext::FRAGMENT {
            FRAGMENT_HEADER_SIZE
        } else {
            (buffer[offset + 1] as usize + 1) * 8
        };
        if buffer.len() < offset + len {
            return Err(Error::Parse(format!(
                "IPv6 extension header {} truncated",
                kind
            )));
        }
        headers.push(ExtHeader {
            kind,
            offset,
            len,
            kind_offset,
        });
        kind_offset = offset;
        kind = buffer[offset];
        offset += len;
    }

    Ok((headers, kind, offset))
}

/// Owned IPv6 packet that can be rewritten in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet {
    buffer: Vec<u8>,
    ext_headers: Vec<ExtHeader>,
    upper_protocol: u8,
    upper_offset: usize,
}

impl Ipv6Packet {
    /// Create from raw bytes (copies the data) and walk the extension header chain.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Parse("IPv6 packet too short".into()));
        }

        if data[0] >> 4 != 6 {
            return Err(Error::InvalidPacket("not an IPv6 packet".into()));
        }

        let payload_length = u16::from_be_bytes([data[4], data[5]]) as usize;
        if HEADER_SIZE + payload_length > data.len() {
            return Err(Error::Parse(format!(
                "IPv6 payload length {} exceeds buffer of {}",
                payload_length,
                data.len()
            )));
        }

        let buffer = data[..HEADER_SIZE + payload_length].to_vec();
        let (ext_headers, upper_protocol, upper_offset) = walk_ext_headers(&buffer)?;

        Ok(Self {
            buffer,
            ext_headers,
            upper_protocol,
            upper_offset,
        })
    }

    pub fn hop_limit(&self) -> u8 {
        self.buffer[7]
    }

    /// Decrement Hop Limit.
    /// Returns false if hop limit would become 0 (packet should be dropped).
    pub fn decrement_hop_limit(&mut self) -> bool {
        if self.buffer[7] <= 1 {
            return false;
        }

        self.buffer[7] -= 1;
        true
    }

    pub fn set_hop_limit(&mut self, hop_limit: u8) {
        self.buffer[7] = hop_limit;
    }

    /// Next header of the fixed header
    pub fn next_header(&self) -> u8 {
        self.buffer[6]
    }

    pub fn src_addr(&self) -> Ipv6Addr {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.buffer[8..24]);
        Ipv6Addr::from(bytes)
    }

    pub fn dst_addr(&self) -> Ipv6Addr {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.buffer[24..40]);
        Ipv6Addr::from(bytes)
    }

    pub fn set_src_addr(&mut self, addr: Ipv6Addr) {
        self.buffer[8..24].copy_from_slice(&addr.octets());
    }

    pub fn set_dst_addr(&mut self, addr: Ipv6Addr) {
        self.buffer[24..40].copy_from_slice(&addr.octets());
    }

    pub fn payload_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// Fixed header bytes
    pub fn header(&self) -> &[u8] {
        &self.buffer[..HEADER_SIZE]
    }

    /// Everything after the fixed header, extension headers included
    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }

    pub fn ext_headers(&self) -> &[ExtHeader] {
        &self.ext_headers
    }

    pub fn has_ext_header(&self, kind: u8) -> bool {
        self.ext_headers.iter().any(|h| h.kind == kind)
    }

    /// Raw bytes of the first extension header of the given kind.
    pub fn ext_header(&self, kind: u8) -> Option<&[u8]> {
        self.ext_headers
            .iter()
            .find(|h| h.kind == kind)
            .map(|h| &self.buffer[h.offset..h.offset + h.len])
    }

    /// Protocol after the extension header chain (the "payload type")
    pub fn upper_protocol(&self) -> u8 {
        self.upper_protocol
    }

    /// Upper-layer payload after the extension header chain
    pub fn upper_payload(&self) -> &[u8] {
        &self.buffer[self.upper_offset..]
    }

    /// Parsed routing header, if the packet carries one.
    pub fn routing_header(&self) -> Option<RoutingHeader<'_>> {
        self.ext_header(ext::ROUTING).map(RoutingHeader::new)
    }

    /// Overwrite the Segments Left field of the routing header.
    pub fn set_segments_left(&mut self, segments_left: u8) -> bool {
        match self.ext_headers.iter().find(|h| h.kind == ext::ROUTING) {
            Some(h) => {
                self.buffer[h.offset + 3] = segments_left;
                true
            }
            None => false,
        }
    }

    /// Remove the first extension header of the given kind, relinking the chain.
    pub fn remove_ext_header(&mut self, kind: u8) -> bool {
        let Some(h) = self.ext_headers.iter().find(|h| h.kind == kind).copied() else {
            return false;
        };

        let following = self.buffer[h.offset];
        self.buffer[h.kind_offset] = following;
        self.buffer.drain(h.offset..h.offset + h.len);

        let payload_length = (self.buffer.len() - HEADER_SIZE) as u16;
        self.buffer[4..6].copy_from_slice(&payload_length.to_be_bytes());

        // The chain was valid before the splice, so it stays valid after it.
        if let Ok((headers, upper_protocol, upper_offset)) = walk_ext_headers(&self.buffer) {
            self.ext_headers = headers;
            self.upper_protocol = upper_protocol;
            self.upper_offset = upper_offset;
        }
        true
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Zero-copy view of a routing header (type 4 adds the segment list).
#[derive(Debug, Clone, Copy)]
pub struct RoutingHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> RoutingHeader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    pub fn routing_type(&self) -> u8 {
        self.buffer[2]
    }

    pub fn segments_left(&self) -> u8 {
        self.buffer[3]
    }

    pub fn is_srh(&self) -> bool {
        self.routing_type() == ROUTING_TYPE_SRH && self.buffer.len() >= SRH_FIXED_SIZE
    }

    /// Index of the last element of the segment list
    pub fn last_entry(&self) -> u8 {
        self.buffer.get(4).copied().unwrap_or(0)
    }

    pub fn flags(&self) -> u8 {
        self.buffer.get(5).copied().unwrap_or(0)
    }

    pub fn cleanup(&self) -> bool {
        self.flags() & SRH_FLAG_CLEANUP != 0
    }

    /// Number of segments that fit in the header
    pub fn segment_count(&self) -> usize {
        self.buffer.len().saturating_sub(SRH_FIXED_SIZE) / 16
    }

    /// Segment List[index]; index 0 is the final destination.
    pub fn segment(&self, index: usize) -> Option<Ipv6Addr> {
        let start = SRH_FIXED_SIZE + index * 16;
        let bytes: [u8; 16] = self.buffer.get(start..start + 16)?.try_into().ok()?;
        Some(Ipv6Addr::from(bytes))
    }
}

/// Encode a segment routing header. `segments` is given in travel order;
/// the list is stored reversed as the wire format requires.
pub fn build_srh(segments: &[Ipv6Addr], segments_left: u8, cleanup: bool) -> Vec<u8> {
    let len = SRH_FIXED_SIZE + segments.len() * 16;
    let mut buffer = vec![0u8; len];

    buffer[1] = (len / 8 - 1) as u8;
    buffer[2] = ROUTING_TYPE_SRH;
    buffer[3] = segments_left;
    buffer[4] = segments.len().saturating_sub(1) as u8;
    if cleanup {
        buffer[5] = SRH_FLAG_CLEANUP;
    }

    for (i, segment) in segments.iter().rev().enumerate() {
        let start = SRH_FIXED_SIZE + i * 16;
        buffer[start..start + 16].copy_from_slice(&segment.octets());
    }
    buffer
}

/// Builder for constructing IPv6 packets
#[derive(Debug, Clone)]
pub struct Ipv6Builder {
    traffic_class: u8,
    flow_label: u32,
    next_header: u8,
    hop_limit: u8,
    src_addr: Ipv6Addr,
    dst_addr: Ipv6Addr,
    ext_headers: Vec<(u8, Vec<u8>)>,
    payload: Vec<u8>,
}

impl Ipv6Builder {
    pub fn new() -> Self {
        Self {
            traffic_class: 0,
            flow_label: 0,
            next_header: ext::NO_NEXT_HEADER,
            hop_limit: DEFAULT_HOP_LIMIT,
            src_addr: Ipv6Addr::UNSPECIFIED,
            dst_addr: Ipv6Addr::UNSPECIFIED,
            ext_headers: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn traffic_class(mut self, tc: u8) -> Self {
        self.traffic_class = tc;
        self
    }

    pub fn flow_label(mut self, fl: u32) -> Self {
        self.flow_label = fl & 0xFFFFF; // 20 bits
        self
    }

    /// Upper-layer protocol of the payload
    pub fn next_header(mut self, nh: u8) -> Self {
        self.next_header = nh;
        self
    }

    pub fn hop_limit(mut self, hl: u8) -> Self {
        self.hop_limit = hl;
        self
    }

    pub fn src_addr(mut self, addr: Ipv6Addr) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn dst_addr(mut self, addr: Ipv6Addr) -> Self {
        self.dst_addr = addr;
        self
    }

    /// Append an extension header. Its first byte is overwritten with the
    /// next header value when the chain is built.
    pub fn ext_header(mut self, kind: u8, bytes: Vec<u8>) -> Self {
        self.ext_headers.push((kind, bytes));
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let ext_len: usize = self.ext_headers.iter().map(|(_, b)| b.len()).sum();
        let payload_length = (ext_len + self.payload.len()) as u16;
        let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_length as usize);

        // Version (6) + Traffic Class + Flow Label
        buffer.push(0x60 | (self.traffic_class >> 4));
        buffer.push(((self.traffic_class & 0x0F) << 4) | ((self.flow_label >> 16) as u8 & 0x0F));
        buffer.push((self.flow_label >> 8) as u8);
        buffer.push(self.flow_label as u8);
        buffer.extend_from_slice(&payload_length.to_be_bytes());

        let first = self
            .ext_headers
            .first()
            .map(|(kind, _)| *kind)
            .unwrap_or(self.next_header);
        buffer.push(first);
        buffer.push(self.hop_limit);
        buffer.extend_from_slice(&self.src_addr.octets());
        buffer.extend_from_slice(&self.dst_addr.octets());

        for (i, (_, bytes)) in self.ext_headers.iter().enumerate() {
            let next = self
                .ext_headers
                .get(i + 1)
                .map(|(kind, _)| *kind)
                .unwrap_or(self.next_header);
            let start = buffer.len();
            buffer.extend_from_slice(bytes);
            if let Some(b) = buffer.get_mut(start) {
                *b = next;
            }
        }

        buffer.extend_from_slice(&self.payload);
        buffer
    }
}

impl Default for Ipv6Builder {
    fn default() -> Self {
        Self::new()
    }
}
