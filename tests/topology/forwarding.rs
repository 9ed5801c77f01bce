//! Routing and forwarding across in-process links

use crate::net::{addr, echo_request, host, listen, sock, udp, Inbox, Probe};
use ipstack::dataplane::{InterfaceRef, IpLink, IpLinkInterface, Ipv4Node, NetInterface, NodeConfig};
use ipstack::protocol::icmp::{IcmpPacket, IcmpType};
use ipstack::protocol::ipv4::Protocol;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// client 10.0.1.2 -- 10.0.1.1 router 10.0.2.1 -- 10.0.2.2 server
struct Routed {
    router: Arc<Ipv4Node>,
    lan: InterfaceRef<Ipv4Addr>,
    client: Arc<Ipv4Node>,
    server: Arc<Ipv4Node>,
    client_icmp: Inbox,
    server_udp: Inbox,
}

fn routed() -> Routed {
    let lan_link = IpLink::new("10.0.1.0/24".parse().unwrap());
    let wan_link = IpLink::new("10.0.2.0/24".parse().unwrap());

    let router = Ipv4Node::new(NodeConfig::router());
    let lan: InterfaceRef<Ipv4Addr> = IpLinkInterface::new(&lan_link);
    router.add_interface(lan.clone());
    router.add_interface(IpLinkInterface::new(&wan_link));

    let client = host(&lan_link, "10.0.1.1");
    let server = host(&wan_link, "10.0.2.1");
    let client_icmp = listen(&client, Protocol::Icmp);
    let server_udp = listen(&server, Protocol::Udp);

    Routed {
        router,
        lan,
        client,
        server,
        client_icmp,
        server_udp,
    }
}

#[test]
fn test_addresses_follow_link_pool() {
    let net = routed();
    assert_eq!(net.router.addresses()[0], addr("10.0.1.1"));
    assert_eq!(net.client.address(), Some(addr("10.0.1.2")));
    assert_eq!(net.server.address(), Some(addr("10.0.2.2")));
}

#[test]
fn test_echo_across_router() {
    let net = routed();

    assert!(net
        .client
        .send_packet(echo_request(addr("10.0.1.2"), addr("10.0.2.2"), 64, 7)));

    let replies = net.client_icmp.take();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].src_addr(), addr("10.0.2.2"));
    let icmp = IcmpPacket::parse(replies[0].payload()).unwrap();
    assert!(icmp.is_echo_reply());
    assert_eq!(icmp.identifier(), 7);

    // request out and reply back
    assert_eq!(net.router.metrics().packets_forwarded.get(), 2);
    assert_eq!(net.server.metrics().icmp_echo_replies.get(), 1);
}

#[test]
fn test_ttl_expiry_reports_time_exceeded() {
    let net = routed();

    net.client
        .send_packet(echo_request(addr("10.0.1.2"), addr("10.0.2.2"), 1, 9));

    let errors = net.client_icmp.take();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].src_addr(), addr("10.0.1.1"));
    let icmp = IcmpPacket::parse(errors[0].payload()).unwrap();
    assert_eq!(icmp.icmp_type(), IcmpType::TimeExceeded as u8);
    assert_eq!(net.router.metrics().ttl_expired.get(), 1);
    assert_eq!(net.server.metrics().icmp_echo_replies.get(), 0);
}

#[test]
fn test_forwarding_decrements_ttl() {
    let net = routed();

    net.client
        .send_packet(udp(sock("10.0.1.2:4000"), sock("10.0.2.2:53"), 2));

    let received = net.server_udp.take();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].ttl(), 1);
    assert!(received[0].validate_checksum());
}

#[test]
fn test_unroutable_destination_is_dropped() {
    let net = routed();

    net.client
        .send_packet(udp(sock("10.0.1.2:4000"), sock("192.0.2.1:9"), 64));

    let metrics = net.router.metrics();
    assert_eq!(metrics.no_route.get(), 1);
    assert_eq!(metrics.packets_forwarded.get(), 0);
    assert!(net.server_udp.take().is_empty());
}

#[test]
fn test_longest_prefix_wins() {
    let net = routed();
    let link_a = IpLink::new("10.0.3.0/24".parse().unwrap());
    let link_b = IpLink::new("10.0.4.0/24".parse().unwrap());
    net.router.add_interface(IpLinkInterface::new(&link_a));
    net.router.add_interface(IpLinkInterface::new(&link_b));
    let probe_a = Probe::attach(&link_a);
    let probe_b = Probe::attach(&link_b);

    {
        let mut routing = net.router.routing_table();
        routing
            .add_via("172.16.0.0/12".parse().unwrap(), addr("10.0.3.2"))
            .unwrap();
        routing
            .add_via("172.16.5.0/24".parse().unwrap(), addr("10.0.4.2"))
            .unwrap();
    }

    net.client
        .send_packet(udp(sock("10.0.1.2:4000"), sock("172.16.5.9:53"), 64));
    net.client
        .send_packet(udp(sock("10.0.1.2:4000"), sock("172.20.0.1:53"), 64));

    let via_b = probe_b.take();
    assert_eq!(via_b.len(), 1);
    assert_eq!(via_b[0].dst_addr(), addr("172.16.5.9"));
    let via_a = probe_a.take();
    assert_eq!(via_a.len(), 1);
    assert_eq!(via_a[0].dst_addr(), addr("172.20.0.1"));
}

#[test]
fn test_multicast_is_not_forwarded() {
    let net = routed();

    net.client
        .send_packet(udp(sock("10.0.1.2:4000"), sock("239.1.1.1:5000"), 64));

    assert_eq!(net.router.metrics().packets_forwarded.get(), 0);
    assert!(net.server_udp.take().is_empty());
}

#[test]
fn test_removed_interface_takes_its_routes() {
    let net = routed();
    assert_eq!(net.router.routing_table().len(), 2);

    assert!(net.router.remove_interface(&net.lan));

    let interfaces = net.router.interfaces();
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].name(), "ni0");
    assert_eq!(net.router.routing_table().len(), 1);

    net.client
        .send_packet(echo_request(addr("10.0.1.2"), addr("10.0.2.2"), 64, 3));
    assert!(net.client_icmp.take().is_empty());
    assert!(!net.router.remove_interface(&net.lan));
}
