//! ARP client and server halves
//!
//! `ArpSolicitor` broadcasts requests for the resolver client;
//! `ArpServer` answers requests for the addresses an interface owns.

use super::resolver::{ResolverClient, Solicitor};
use crate::protocol::arp::{ArpOp, ArpPacket};
use crate::protocol::ethernet::build_frame;
use crate::protocol::{EtherType, MacAddr};
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Broadcasts ARP requests onto an interface transmit queue.
pub struct ArpSolicitor {
    mac: MacAddr,
    tx: mpsc::Sender<Vec<u8>>,
}

impl ArpSolicitor {
    pub fn new(mac: MacAddr, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { mac, tx }
    }
}

impl Solicitor<Ipv4Addr> for ArpSolicitor {
    fn solicit(&self, target: Ipv4Addr, source: Ipv4Addr) {
        let request = ArpPacket::request(self.mac, source, target);
        let frame = build_frame(MacAddr::BROADCAST, self.mac, EtherType::Arp, &request.to_bytes());
        if self.tx.try_send(frame).is_err() {
            warn!(%target, "transmit queue full, arp request dropped");
        }
    }
}

/// Answers requests for owned addresses. Requests for anything else get
/// no reply.
#[derive(Debug, Clone, Copy)]
pub struct ArpServer {
    mac: MacAddr,
}

impl ArpServer {
    pub fn new(mac: MacAddr) -> Self {
        Self { mac }
    }

    /// Reply frame for `request`, addressed back to the requester.
    pub fn reply_to(&self, request: &ArpPacket, owns: impl Fn(Ipv4Addr) -> bool) -> Option<Vec<u8>> {
        if request.operation != ArpOp::Request || !owns(request.target_ip) {
            return None;
        }
        let reply = ArpPacket::reply(
            self.mac,
            request.target_ip,
            request.sender_mac,
            request.sender_ip,
        );
        Some(build_frame(
            request.sender_mac,
            self.mac,
            EtherType::Arp,
            &reply.to_bytes(),
        ))
    }
}

/// Handle one received ARP payload: requests go to the server, replies
/// to the client. Returns the frame to send back, if any.
pub fn handle_arp(
    payload: &[u8],
    server: &ArpServer,
    client: &ResolverClient<Ipv4Addr>,
) -> Option<Vec<u8>> {
    let packet = match ArpPacket::parse(payload) {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "dropping malformed arp packet");
            return None;
        }
    };
    trace!(op = ?packet.operation, sender = %packet.sender_ip, target = %packet.target_ip, "arp rx");

    match packet.operation {
        ArpOp::Request => server.reply_to(&packet, |addr| client.owns(addr)),
        ArpOp::Reply => {
            client.on_reply(packet.sender_ip, packet.sender_mac);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::resolver::ResolverConfig;
    use crate::protocol::ethernet::Frame;
    use crate::telemetry::MetricsRegistry;
    use std::sync::Arc;

    const LOCAL: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const PEER: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn client() -> (ResolverClient<Ipv4Addr>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        let client = ResolverClient::new(
            ResolverConfig::ipv4(),
            LOCAL,
            Arc::new(ArpSolicitor::new(LOCAL, tx)),
            Arc::new(MetricsRegistry::new()),
        );
        client.add_address("10.0.0.1/24".parse().unwrap());
        (client, rx)
    }

    #[test]
    fn test_solicit_broadcasts_request() {
        let (tx, mut rx) = mpsc::channel(1);
        ArpSolicitor::new(LOCAL, tx).solicit(addr("10.0.0.2"), addr("10.0.0.1"));

        let frame = rx.try_recv().unwrap();
        let eth = Frame::parse(&frame).unwrap();
        assert!(eth.dst_mac().is_broadcast());
        assert_eq!(eth.ethertype(), EtherType::Arp as u16);
        let arp = ArpPacket::parse(eth.payload()).unwrap();
        assert_eq!(arp, ArpPacket::request(LOCAL, addr("10.0.0.1"), addr("10.0.0.2")));
    }

    #[test]
    fn test_server_answers_owned_address() {
        let (client, _rx) = client();
        let server = ArpServer::new(LOCAL);
        let request = ArpPacket::request(PEER, addr("10.0.0.2"), addr("10.0.0.1"));

        let frame = handle_arp(&request.to_bytes(), &server, &client).unwrap();
        let eth = Frame::parse(&frame).unwrap();
        assert_eq!(eth.dst_mac(), PEER);
        let reply = ArpPacket::parse(eth.payload()).unwrap();
        assert_eq!(reply.operation, ArpOp::Reply);
        assert_eq!(reply.sender_ip, addr("10.0.0.1"));
        assert_eq!(reply.sender_mac, LOCAL);
        assert_eq!(reply.target_ip, addr("10.0.0.2"));
    }

    #[test]
    fn test_server_ignores_other_targets() {
        let (client, _rx) = client();
        let server = ArpServer::new(LOCAL);
        let request = ArpPacket::request(PEER, addr("10.0.0.2"), addr("10.0.0.3"));
        assert!(handle_arp(&request.to_bytes(), &server, &client).is_none());
    }

    #[test]
    fn test_malformed_payload() {
        let (client, _rx) = client();
        assert!(handle_arp(&[0; 10], &ArpServer::new(LOCAL), &client).is_none());
    }

    #[tokio::test]
    async fn test_reply_completes_resolution() {
        let (client, mut rx) = client();
        let client = Arc::new(client);
        let server = ArpServer::new(LOCAL);

        let resolving = {
            let client = client.clone();
            tokio::spawn(async move { client.resolve(addr("10.0.0.2")).await })
        };

        // wait for the request, then answer it
        let frame = rx.recv().await.unwrap();
        let request = ArpPacket::parse(Frame::parse(&frame).unwrap().payload()).unwrap();
        let reply = ArpPacket::reply(PEER, request.target_ip, LOCAL, request.sender_ip);
        assert!(handle_arp(&reply.to_bytes(), &server, &client).is_none());

        assert_eq!(resolving.await.unwrap(), Some(PEER));
    }
}
