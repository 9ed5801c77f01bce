//! Forwarding policy hooks
//!
//! A node runs every received packet through its policy: `on_receive` may
//! rewrite or consume it, `classify` decides between local delivery and
//! forwarding, `on_forward` sees the packet after the TTL was decremented,
//! and `allow_icmp_error` gates generated errors. NAT is one such policy.

use super::interface::InterfaceRef;
use super::node::NodeCore;
use crate::protocol::IpPacket;

/// Where a received packet goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Local,
    Forward,
    Drop,
}

/// ICMP errors a node can generate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpErrorKind {
    TimeExceeded,
    DestinationUnreachable,
}

pub trait ForwardingPolicy<P: IpPacket>: Send + Sync {
    /// First look at a received packet. Returning None consumes it.
    fn on_receive(
        &self,
        _core: &NodeCore<P::Addr>,
        _ingress: &InterfaceRef<P::Addr>,
        packet: P,
    ) -> Option<P> {
        Some(packet)
    }

    fn classify(&self, core: &NodeCore<P::Addr>, packet: &P) -> Verdict {
        classify(core, packet)
    }

    /// Last look before a forwarded packet is routed. Returning false drops it.
    fn on_forward(&self, _core: &NodeCore<P::Addr>, _packet: &mut P) -> bool {
        true
    }

    fn allow_icmp_error(&self, _kind: IcmpErrorKind, offending: &P) -> bool {
        !offending.is_icmp_error()
    }
}

/// Owned destinations are local; everything else is forwarded when
/// forwarding is enabled.
pub fn classify<P: IpPacket>(core: &NodeCore<P::Addr>, packet: &P) -> Verdict {
    if core.has_address(packet.dst_addr()) {
        Verdict::Local
    } else if core.forwarding() {
        Verdict::Forward
    } else {
        Verdict::Drop
    }
}

/// Plain router or host behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl<P: IpPacket> ForwardingPolicy<P> for DefaultPolicy {}
