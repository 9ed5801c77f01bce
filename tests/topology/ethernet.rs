//! Nodes on a shared Ethernet segment, resolving next hops with ARP and ND

use crate::net::{addr, echo_request, listen, udp, wait_for, Inbox};
use ipstack::capture::{MemoryHub, MemoryPort};
use ipstack::dataplane::{
    EthConfig, InterfaceRef, Ipv4EthInterface, Ipv4Node, Ipv6EthInterface, Ipv6Node, NodeConfig,
    ResolverConfig,
};
use ipstack::protocol::icmp::IcmpPacket;
use ipstack::protocol::icmpv6::{self, Icmpv6Packet, Icmpv6Type};
use ipstack::protocol::ipv4::Protocol;
use ipstack::protocol::ipv6::Ipv6Packet;
use ipstack::protocol::MacAddr;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

fn v4_node(
    hub: &Arc<MemoryHub>,
    id: u32,
    cidr: &str,
    resolver: ResolverConfig,
) -> (Arc<Ipv4Node>, Arc<Ipv4EthInterface<MemoryPort>>) {
    let node = Ipv4Node::new(NodeConfig::default());
    let iface = Ipv4EthInterface::spawn(
        EthConfig::new("eth", MacAddr::local(id), resolver),
        hub.port(),
        node.metrics().clone(),
    )
    .unwrap();
    let handle: InterfaceRef<Ipv4Addr> = iface.clone();
    node.add_interface(handle.clone());
    node.add_address(&handle, cidr.parse().unwrap());
    (node, iface)
}

fn v6_node(hub: &Arc<MemoryHub>, id: u32, cidr: &str) -> Arc<Ipv6Node> {
    let node = Ipv6Node::new(NodeConfig::default());
    let iface = Ipv6EthInterface::spawn(
        EthConfig::new("eth", MacAddr::local(id), ResolverConfig::ipv6()),
        hub.port(),
        node.metrics().clone(),
    )
    .unwrap();
    let handle: InterfaceRef<Ipv6Addr> = iface;
    node.add_interface(handle.clone());
    node.add_address(&handle, cidr.parse().unwrap());
    node
}

async fn next_reply(inbox: &Inbox) -> Vec<u8> {
    wait_for(|| inbox.take_raw().into_iter().next()).await
}

#[tokio::test]
async fn test_ping_over_arp() {
    let hub = MemoryHub::new();
    let (a, a_iface) = v4_node(&hub, 1, "10.0.0.1/24", ResolverConfig::ipv4());
    let (b, _b_iface) = v4_node(&hub, 2, "10.0.0.2/24", ResolverConfig::ipv4());
    let replies = listen(&a, Protocol::Icmp);

    a.send_packet(echo_request(addr("10.0.0.1"), addr("10.0.0.2"), 64, 1));
    let reply = next_reply(&replies).await;
    let packet = ipstack::protocol::ipv4::Ipv4Packet::from_bytes(&reply).unwrap();
    assert_eq!(packet.src_addr(), addr("10.0.0.2"));
    assert!(IcmpPacket::parse(packet.payload()).unwrap().is_echo_reply());
    assert_eq!(
        a_iface.resolver().cache_entries(),
        vec![(addr("10.0.0.2"), MacAddr::local(2))]
    );

    // the second ping goes out without asking again
    a.send_packet(echo_request(addr("10.0.0.1"), addr("10.0.0.2"), 64, 2));
    next_reply(&replies).await;

    let metrics = a.metrics();
    assert_eq!(metrics.resolution_requests_sent.get(), 1);
    assert!(metrics.resolution_cache_hits.get() >= 1);
    assert_eq!(b.metrics().icmp_echo_replies.get(), 2);
    assert_eq!(b.metrics().resolution_replies_sent.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unresolvable_next_hop_gives_up() {
    let hub = MemoryHub::new();
    let resolver = ResolverConfig {
        retransmit_timeout: Duration::from_millis(100),
        ..ResolverConfig::ipv4()
    };
    let (a, a_iface) = v4_node(&hub, 1, "10.0.0.1/24", resolver);

    a.send_packet(udp(
        "10.0.0.1:4000".parse().unwrap(),
        "10.0.0.9:53".parse().unwrap(),
        64,
    ));

    let metrics = a.metrics().clone();
    wait_for(|| (metrics.resolution_failures.get() == 1).then_some(())).await;
    assert_eq!(metrics.resolution_requests_sent.get(), 3);
    assert!(a_iface.resolver().cache_entries().is_empty());
}

#[tokio::test]
async fn test_ping_over_neighbor_discovery() {
    let hub = MemoryHub::new();
    let a = v6_node(&hub, 1, "2001:db8::1/64");
    let b = v6_node(&hub, 2, "2001:db8::2/64");

    let replies = Inbox::default();
    let sink = replies.clone();
    a.set_listener(
        Protocol::Icmpv6 as u8,
        Arc::new(move |_: &InterfaceRef<Ipv6Addr>, p: &Ipv6Packet| sink.push(p.as_bytes())),
    );

    let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
    let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
    let request = vec![Icmpv6Type::EchoRequest as u8, 0, 0, 0, 0, 5, 0, 1, b'h', b'i'];
    let bytes = icmpv6::encapsulate(src, dst, 64, request);
    a.send_packet(Ipv6Packet::from_bytes(&bytes).unwrap());

    let reply = next_reply(&replies).await;
    let packet = Ipv6Packet::from_bytes(&reply).unwrap();
    assert_eq!(packet.src_addr(), dst);
    let msg = Icmpv6Packet::parse(packet.upper_payload()).unwrap();
    assert_eq!(msg.msg_type(), Icmpv6Type::EchoReply as u8);
    assert_eq!(b.metrics().icmp_echo_replies.get(), 1);
    assert_eq!(a.metrics().resolution_requests_sent.get(), 1);
}
