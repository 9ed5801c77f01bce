//! Ethernet II framing

use super::{EtherType, MacAddr};
use crate::{Error, Result};

/// Ethernet header size
pub const HEADER_SIZE: usize = 14;
/// Minimum frame size on the wire (without FCS)
pub const MIN_FRAME_SIZE: usize = 60;
/// Maximum frame size (without FCS)
pub const MAX_FRAME_SIZE: usize = 1518;

/// Parsed Ethernet frame (zero-copy reference)
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("frame too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn dst_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.buffer[0..6]);
        MacAddr(mac)
    }

    pub fn src_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.buffer[6..12]);
        MacAddr(mac)
    }

    pub fn ethertype(&self) -> u16 {
        u16::from_be_bytes([self.buffer[12], self.buffer[13]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

/// Build an Ethernet frame, padding it to the minimum size.
pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity((HEADER_SIZE + payload.len()).max(MIN_FRAME_SIZE));
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&(ethertype as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    if frame.len() < MIN_FRAME_SIZE {
        frame.resize(MIN_FRAME_SIZE, 0);
    }
    frame
}
