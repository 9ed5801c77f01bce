//! Frame I/O backends
//!
//! Ethernet interfaces read and write whole frames through a `Capture`:
//! - AF_PACKET: raw socket bound to a Linux device
//! - Memory: port on an in-process hub, for tests and demos

mod af_packet;
mod memory;

pub use af_packet::AfPacketSocket;
pub use memory::{MemoryHub, MemoryPort};

use crate::Result;
use std::future::Future;

/// Information about a received frame
#[derive(Debug, Clone)]
pub struct RxInfo {
    /// Number of bytes received
    pub len: usize,
    /// VLAN ID if the kernel stripped it
    pub vlan_id: Option<u16>,
}

/// Frame capture backend
///
/// Receive and transmit run on separate tasks, so both take `&self`.
pub trait Capture: Send + Sync + 'static {
    /// Receive a frame into the provided buffer
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = Result<RxInfo>> + Send;

    /// Send a frame
    fn send(&self, buf: &[u8]) -> impl Future<Output = Result<usize>> + Send;
}
