//! Topology building blocks shared by the tests

use ipstack::dataplane::{
    InterfaceListener, InterfaceRef, IpLink, IpLinkInterface, Ipv4Node, NetInterface, NodeConfig,
};
use ipstack::protocol::icmp::EchoRequestBuilder;
use ipstack::protocol::ipv4::{Ipv4Builder, Ipv4Packet, Protocol};
use ipstack::protocol::udp::UdpBuilder;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn sock(s: &str) -> SocketAddrV4 {
    s.parse().unwrap()
}

/// Packets collected by a node protocol listener or a raw probe
#[derive(Clone, Default)]
pub struct Inbox(Arc<Mutex<Vec<Vec<u8>>>>);

impl Inbox {
    pub fn take_raw(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn take(&self) -> Vec<Ipv4Packet> {
        self.take_raw()
            .iter()
            .map(|p| Ipv4Packet::from_bytes(p).unwrap())
            .collect()
    }

    pub fn push(&self, packet: &[u8]) {
        self.0.lock().unwrap().push(packet.to_vec());
    }
}

/// Collect what `node` delivers locally for `protocol`.
pub fn listen(node: &Ipv4Node, protocol: Protocol) -> Inbox {
    let inbox = Inbox::default();
    let sink = inbox.clone();
    node.set_listener(
        protocol as u8,
        Arc::new(move |_: &InterfaceRef<Ipv4Addr>, p: &Ipv4Packet| sink.push(p.as_bytes())),
    );
    inbox
}

/// Bare interface on a link that records packets addressed to it.
pub struct Probe {
    pub iface: Arc<IpLinkInterface<Ipv4Addr>>,
    recorder: Arc<Recorder>,
}

struct Recorder(Inbox);

impl InterfaceListener<Ipv4Addr> for Recorder {
    fn on_incoming_packet(&self, _iface: &InterfaceRef<Ipv4Addr>, packet: &[u8]) {
        self.0.push(packet);
    }
}

impl Probe {
    pub fn attach(link: &Arc<IpLink<Ipv4Addr>>) -> Self {
        let iface = IpLinkInterface::new(link);
        let recorder = Arc::new(Recorder(Inbox::default()));
        iface.add_listener(Arc::downgrade(&recorder) as Weak<dyn InterfaceListener<Ipv4Addr>>);
        Self { iface, recorder }
    }

    pub fn take(&self) -> Vec<Ipv4Packet> {
        self.recorder.0.take()
    }
}

/// Host on `link` with a default route through `gateway`.
pub fn host(link: &Arc<IpLink<Ipv4Addr>>, gateway: &str) -> Arc<Ipv4Node> {
    let node = Ipv4Node::new(NodeConfig::default());
    node.add_interface(IpLinkInterface::new(link));
    node.routing_table()
        .add_via("0.0.0.0/0".parse().unwrap(), addr(gateway))
        .unwrap();
    node
}

pub fn udp(src: SocketAddrV4, dst: SocketAddrV4, ttl: u8) -> Ipv4Packet {
    let datagram = UdpBuilder::new()
        .src_port(src.port())
        .dst_port(dst.port())
        .payload(b"query")
        .build(*src.ip(), *dst.ip());
    Ipv4Builder::new()
        .protocol(Protocol::Udp as u8)
        .ttl(ttl)
        .src_addr(*src.ip())
        .dst_addr(*dst.ip())
        .payload(&datagram)
        .build_packet()
}

pub fn echo_request(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, id: u16) -> Ipv4Packet {
    Ipv4Builder::new()
        .protocol(Protocol::Icmp as u8)
        .ttl(ttl)
        .src_addr(src)
        .dst_addr(dst)
        .payload(&EchoRequestBuilder::new(id, 1).payload(b"ping").build())
        .build_packet()
}

/// Poll until `check` yields, sleeping between attempts. Works with paused
/// time as well, where each sleep advances the clock.
pub async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..1000 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
