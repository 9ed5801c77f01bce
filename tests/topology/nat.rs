//! NAT between a private LAN and a public segment

use crate::net::{addr, echo_request, host, listen, sock, udp, Inbox};
use ipstack::dataplane::{
    IfAddr, InterfaceRef, IpLink, IpLinkInterface, Ipv4Node, NatConfig, NatPolicy, NatProtocol,
    NodeConfig,
};
use ipstack::protocol::icmp::IcmpPacket;
use ipstack::protocol::ipv4::{Ipv4Packet, Protocol};
use ipstack::protocol::udp::UdpPacket;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

/// hosts 10.0.0.2, 10.0.0.3 -- 10.0.0.1 nat 1.2.3.4 -- 1.2.3.8 server
struct Natted {
    nat: Arc<Ipv4Node>,
    policy: Arc<NatPolicy>,
    host1: Arc<Ipv4Node>,
    host2: Arc<Ipv4Node>,
    server: Arc<Ipv4Node>,
    host1_udp: Inbox,
    host2_udp: Inbox,
    server_udp: Inbox,
}

fn natted(config: NatConfig) -> Natted {
    let lan_link = IpLink::new("10.0.0.0/24".parse().unwrap());
    let wan_link = IpLink::new("1.2.3.0/24".parse().unwrap());

    let nat = Ipv4Node::new(NodeConfig::default());
    let internal: InterfaceRef<Ipv4Addr> = IpLinkInterface::new(&lan_link);
    let external: InterfaceRef<Ipv4Addr> =
        IpLinkInterface::with_address(&wan_link, Some(IfAddr::unicast(addr("1.2.3.4"), 24)));
    nat.add_interface(internal.clone());
    nat.add_interface(external.clone());
    let policy = NatPolicy::install(&nat, internal, external, config).unwrap();

    let host1 = host(&lan_link, "10.0.0.1");
    let host2 = host(&lan_link, "10.0.0.1");
    let server = Ipv4Node::new(NodeConfig::default());
    server.add_interface(IpLinkInterface::with_address(
        &wan_link,
        Some(IfAddr::unicast(addr("1.2.3.8"), 24)),
    ));

    Natted {
        host1_udp: listen(&host1, Protocol::Udp),
        host2_udp: listen(&host2, Protocol::Udp),
        server_udp: listen(&server, Protocol::Udp),
        nat,
        policy,
        host1,
        host2,
        server,
    }
}

fn ports(packet: &Ipv4Packet) -> (u16, u16) {
    let udp = UdpPacket::from_bytes(packet.payload()).unwrap();
    (udp.src_port(), udp.dst_port())
}

fn source(packet: &Ipv4Packet) -> SocketAddrV4 {
    SocketAddrV4::new(packet.src_addr(), ports(packet).0)
}

#[test]
fn test_nat_takes_over_forwarding() {
    let net = natted(NatConfig::default());
    assert!(net.nat.forwarding());
    assert_eq!(net.policy.external_addr(), addr("1.2.3.4"));
    assert_eq!(net.host1.address(), Some(addr("10.0.0.2")));
    assert_eq!(net.host2.address(), Some(addr("10.0.0.3")));
}

#[test]
fn test_udp_round_trip() {
    let net = natted(NatConfig::default());

    net.host1
        .send_packet(udp(sock("10.0.0.2:5000"), sock("1.2.3.8:53"), 64));

    let outbound = net.server_udp.take();
    assert_eq!(outbound.len(), 1);
    let external = source(&outbound[0]);
    assert_eq!(*external.ip(), addr("1.2.3.4"));
    assert!((6200..=6299).contains(&external.port()));

    net.server.send_packet(udp(sock("1.2.3.8:53"), external, 64));

    let replies = net.host1_udp.take();
    assert_eq!(replies.len(), 1);
    assert_eq!(source(&replies[0]), sock("1.2.3.8:53"));
    assert_eq!(replies[0].dst_addr(), addr("10.0.0.2"));
    assert_eq!(ports(&replies[0]).1, 5000);

    let metrics = net.nat.metrics();
    assert_eq!(metrics.nat_translated_out.get(), 1);
    assert_eq!(metrics.nat_translated_in.get(), 1);
    assert_eq!(net.policy.len(NatProtocol::Udp), 1);
    assert_eq!(net.policy.available_ports(NatProtocol::Udp), 99);
}

#[test]
fn test_hosts_get_distinct_ports() {
    let net = natted(NatConfig::default());

    net.host1
        .send_packet(udp(sock("10.0.0.2:5000"), sock("1.2.3.8:53"), 64));
    net.host2
        .send_packet(udp(sock("10.0.0.3:5000"), sock("1.2.3.8:53"), 64));

    let outbound = net.server_udp.take();
    assert_eq!(outbound.len(), 2);
    let first = source(&outbound[0]);
    let second = source(&outbound[1]);
    assert_ne!(first.port(), second.port());

    net.server.send_packet(udp(sock("1.2.3.8:53"), second, 64));
    assert!(net.host1_udp.take().is_empty());
    assert_eq!(ports(&net.host2_udp.take()[0]).1, 5000);
}

#[test]
fn test_unsolicited_inbound_is_dropped() {
    let net = natted(NatConfig::default());

    net.server
        .send_packet(udp(sock("1.2.3.8:53"), sock("1.2.3.4:6200"), 64));

    assert!(net.host1_udp.take().is_empty());
    assert!(net.host2_udp.take().is_empty());
    assert_eq!(net.nat.metrics().nat_dropped.get(), 1);
}

#[test]
fn test_static_mapping_admits_inbound() {
    let net = natted(NatConfig::default());
    net.policy
        .add_static(NatProtocol::Udp, sock("1.2.3.4:5353"), sock("10.0.0.2:53"))
        .unwrap();

    net.server
        .send_packet(udp(sock("1.2.3.8:40000"), sock("1.2.3.4:5353"), 64));

    let inbound = net.host1_udp.take();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].dst_addr(), addr("10.0.0.2"));
    assert_eq!(ports(&inbound[0]), (40000, 53));

    // the answer leaves through the mapped port
    net.host1
        .send_packet(udp(sock("10.0.0.2:53"), sock("1.2.3.8:40000"), 64));
    let answer = net.server_udp.take();
    assert_eq!(source(&answer[0]), sock("1.2.3.4:5353"));
}

#[test]
fn test_idle_mapping_expires() {
    let net = natted(NatConfig {
        entry_timeout: Duration::from_millis(50),
        ..NatConfig::default()
    });

    net.host1
        .send_packet(udp(sock("10.0.0.2:5000"), sock("1.2.3.8:53"), 64));
    let external = source(&net.server_udp.take()[0]);
    assert_eq!(net.policy.available_ports(NatProtocol::Udp), 99);

    std::thread::sleep(Duration::from_millis(120));
    net.server.send_packet(udp(sock("1.2.3.8:53"), external, 64));

    assert!(net.host1_udp.take().is_empty());
    assert_eq!(net.nat.metrics().nat_dropped.get(), 1);
    assert_eq!(net.policy.len(NatProtocol::Udp), 0);
    assert_eq!(net.policy.available_ports(NatProtocol::Udp), 100);
}

#[test]
fn test_ping_through_nat_keeps_identifier() {
    let net = natted(NatConfig::default());
    let host_icmp = listen(&net.host1, Protocol::Icmp);

    net.host1
        .send_packet(echo_request(addr("10.0.0.2"), addr("1.2.3.8"), 64, 77));

    let replies = host_icmp.take();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].src_addr(), addr("1.2.3.8"));
    let icmp = IcmpPacket::parse(replies[0].payload()).unwrap();
    assert!(icmp.is_echo_reply());
    assert_eq!(icmp.identifier(), 77);
    assert_eq!(net.server.metrics().icmp_echo_replies.get(), 1);
    assert_eq!(net.policy.len(NatProtocol::Icmp), 1);
}

#[test]
fn test_traffic_to_the_nat_itself_is_not_translated() {
    let net = natted(NatConfig::default());
    let nat_udp = listen(&net.nat, Protocol::Udp);

    net.host1
        .send_packet(udp(sock("10.0.0.2:5000"), sock("10.0.0.1:7"), 64));

    let received = nat_udp.take();
    assert_eq!(received.len(), 1);
    assert_eq!(source(&received[0]), sock("10.0.0.2:5000"));
    assert_eq!(net.nat.metrics().nat_translated_out.get(), 0);
}
