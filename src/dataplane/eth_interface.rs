//! Ethernet-backed network interface
//!
//! An `EthInterface` owns a frame `Capture` and two tasks: a receive loop
//! that demultiplexes resolution traffic from IP packets, and a transmit
//! task draining a bounded frame queue. `send` resolves the next hop first;
//! unresolved next hops are handed to a bounded set of resolution tasks.

use super::arp::{handle_arp, ArpServer, ArpSolicitor};
use super::interface::{IfAddr, InterfaceListener, InterfaceRef, InterfaceState, ListenerSet, NetInterface};
use super::lock;
use super::ndp::{handle_ndp, NdServer, NdSolicitor};
use super::resolver::{ResolverClient, ResolverConfig, Solicitor};
use crate::capture::Capture;
use crate::protocol::ethernet::{build_frame, Frame};
use crate::protocol::ipv6::Ipv6Packet;
use crate::protocol::{EtherType, IpAddress, MacAddr};
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const RX_BUFFER_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct EthConfig {
    pub name: String,
    pub mac: MacAddr,
    pub resolver: ResolverConfig,
    /// Frames waiting for the transmit task
    pub tx_queue_depth: usize,
    /// Resolutions allowed in flight before packets are dropped
    pub max_pending_resolutions: usize,
}

impl EthConfig {
    pub fn new(name: &str, mac: MacAddr, resolver: ResolverConfig) -> Self {
        Self {
            name: name.to_string(),
            mac,
            resolver,
            tx_queue_depth: 256,
            max_pending_resolutions: 64,
        }
    }
}

/// Address family specifics of an Ethernet link
pub trait LinkFamily: IpAddress {
    const ETHERTYPE: EtherType;

    type Server: Send + Sync + 'static;

    fn server(mac: MacAddr) -> Self::Server;

    fn solicitor(mac: MacAddr, tx: mpsc::Sender<Vec<u8>>) -> Arc<dyn Solicitor<Self>>;

    /// Take resolution traffic out of a received frame, queueing any reply
    /// on `tx`. Returns true when the frame was consumed.
    fn handle_resolution(
        frame: &Frame<'_>,
        server: &Self::Server,
        client: &ResolverClient<Self>,
        tx: &mpsc::Sender<Vec<u8>>,
    ) -> bool;
}

fn queue_reply<A: IpAddress>(
    tx: &mpsc::Sender<Vec<u8>>,
    client: &ResolverClient<A>,
    reply: Option<Vec<u8>>,
) {
    if let Some(frame) = reply {
        match tx.try_send(frame) {
            Ok(()) => client.metrics().resolution_replies_sent.inc(),
            Err(_) => warn!("transmit queue full, resolution reply dropped"),
        }
    }
}

impl LinkFamily for Ipv4Addr {
    const ETHERTYPE: EtherType = EtherType::Ipv4;

    type Server = ArpServer;

    fn server(mac: MacAddr) -> ArpServer {
        ArpServer::new(mac)
    }

    fn solicitor(mac: MacAddr, tx: mpsc::Sender<Vec<u8>>) -> Arc<dyn Solicitor<Self>> {
        Arc::new(ArpSolicitor::new(mac, tx))
    }

    fn handle_resolution(
        frame: &Frame<'_>,
        server: &ArpServer,
        client: &ResolverClient<Self>,
        tx: &mpsc::Sender<Vec<u8>>,
    ) -> bool {
        if frame.ethertype() != EtherType::Arp as u16 {
            return false;
        }
        queue_reply(tx, client, handle_arp(frame.payload(), server, client));
        true
    }
}

impl LinkFamily for Ipv6Addr {
    const ETHERTYPE: EtherType = EtherType::Ipv6;

    type Server = NdServer;

    fn server(mac: MacAddr) -> NdServer {
        NdServer::new(mac)
    }

    fn solicitor(mac: MacAddr, tx: mpsc::Sender<Vec<u8>>) -> Arc<dyn Solicitor<Self>> {
        Arc::new(NdSolicitor::new(mac, tx))
    }

    fn handle_resolution(
        frame: &Frame<'_>,
        server: &NdServer,
        client: &ResolverClient<Self>,
        tx: &mpsc::Sender<Vec<u8>>,
    ) -> bool {
        if frame.ethertype() != EtherType::Ipv6 as u16 {
            return false;
        }
        // malformed packets are left to the node, which logs the drop
        let Ok(packet) = Ipv6Packet::from_bytes(frame.payload()) else {
            return false;
        };
        match handle_ndp(&packet, frame.src_mac(), server, client) {
            Some(reply) => {
                queue_reply(tx, client, reply);
                true
            }
            None => false,
        }
    }
}

pub struct EthInterface<A: LinkFamily, C: Capture> {
    state: InterfaceState<A>,
    listeners: ListenerSet<A>,
    mac: MacAddr,
    resolver: Arc<ResolverClient<A>>,
    server: A::Server,
    tx: mpsc::Sender<Vec<u8>>,
    permits: Arc<Semaphore>,
    runtime: Handle,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<MetricsRegistry>,
    capture: Arc<C>,
    self_ref: Weak<Self>,
}

pub type Ipv4EthInterface<C> = EthInterface<Ipv4Addr, C>;
pub type Ipv6EthInterface<C> = EthInterface<Ipv6Addr, C>;

impl<A: LinkFamily, C: Capture> EthInterface<A, C> {
    /// Wrap `capture` and start the receive and transmit tasks on the
    /// current tokio runtime.
    pub fn spawn(config: EthConfig, capture: C, metrics: Arc<MetricsRegistry>) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::Config("ethernet interfaces need a tokio runtime".into()))?;

        let (tx, rx) = mpsc::channel(config.tx_queue_depth.max(1));
        let solicitor = A::solicitor(config.mac, tx.clone());
        let resolver = Arc::new(ResolverClient::new(
            config.resolver,
            config.mac,
            solicitor,
            metrics.clone(),
        ));

        let iface = Arc::new_cyclic(|self_ref| Self {
            state: InterfaceState::new(&config.name),
            listeners: ListenerSet::default(),
            mac: config.mac,
            resolver,
            server: A::server(config.mac),
            tx,
            permits: Arc::new(Semaphore::new(config.max_pending_resolutions.max(1))),
            runtime: runtime.clone(),
            running: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
            metrics,
            capture: Arc::new(capture),
            self_ref: self_ref.clone(),
        });

        let tx_task = runtime.spawn(Self::transmit_loop(
            Arc::downgrade(&iface),
            iface.capture.clone(),
            rx,
        ));
        let rx_task = runtime.spawn(Self::receive_loop(
            Arc::downgrade(&iface),
            iface.capture.clone(),
        ));
        lock(&iface.tasks).extend([tx_task, rx_task]);

        info!(iface = %config.name, mac = %config.mac, family = A::FAMILY, "ethernet interface up");
        Ok(iface)
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn resolver(&self) -> &Arc<ResolverClient<A>> {
        &self.resolver
    }

    pub fn capture(&self) -> &Arc<C> {
        &self.capture
    }

    async fn transmit_loop(iface: Weak<Self>, capture: Arc<C>, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = capture.send(&frame).await {
                let Some(me) = iface.upgrade() else {
                    break;
                };
                warn!(iface = %me.name(), error = %e, "frame transmit failed");
                me.metrics.record_tx_drop(&me.name());
            }
        }
    }

    async fn receive_loop(iface: Weak<Self>, capture: Arc<C>) {
        let mut buf = vec![0u8; RX_BUFFER_SIZE];
        loop {
            let info = match capture.recv(&mut buf).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(error = %e, "frame receive failed, stopping receive loop");
                    break;
                }
            };
            let Some(me) = iface.upgrade() else {
                break;
            };
            me.on_frame(&buf[..info.len]);
        }
    }

    fn on_frame(&self, data: &[u8]) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let frame = match Frame::parse(data) {
            Ok(f) => f,
            Err(e) => {
                trace!(iface = %self.name(), error = %e, "runt frame");
                return;
            }
        };
        // raw sockets also see what we transmit
        if frame.src_mac() == self.mac {
            return;
        }
        if A::handle_resolution(&frame, &self.server, &self.resolver, &self.tx) {
            return;
        }
        if frame.ethertype() != A::ETHERTYPE as u16 {
            return;
        }

        let dst = frame.dst_mac();
        let accepted = dst == self.mac || dst.is_multicast();
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        let me: InterfaceRef<A> = me;
        self.listeners.deliver(&me, frame.payload(), accepted);
    }

    fn enqueue(&self, dst: MacAddr, packet: &[u8]) {
        let frame = build_frame(dst, self.mac, A::ETHERTYPE, packet);
        match self.tx.try_send(frame) {
            Ok(()) => trace!(iface = %self.name(), %dst, len = packet.len(), "frame queued"),
            Err(TrySendError::Full(_)) => {
                warn!(iface = %self.name(), "transmit queue full, frame dropped");
                self.metrics.record_tx_drop(&self.name());
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_tx_drop(&self.name());
            }
        }
    }
}

impl<A: LinkFamily, C: Capture> NetInterface<A> for EthInterface<A, C> {
    fn name(&self) -> String {
        self.state.name()
    }

    fn set_name(&self, name: &str) {
        self.state.set_name(name);
    }

    fn addresses(&self) -> Vec<IfAddr<A>> {
        self.state.addresses()
    }

    fn add_address(&self, addr: IfAddr<A>) {
        self.state.add_address(addr);
        self.resolver.add_address(addr);
    }

    fn remove_address(&self, addr: A) -> bool {
        self.resolver.remove_address(addr);
        self.state.remove_address(addr)
    }

    fn has_address(&self, addr: A) -> bool {
        self.state.has_address(addr)
    }

    fn send(&self, packet: Vec<u8>, next_hop: A) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        if let Some(mac) = self.resolver.lookup_cached(next_hop) {
            self.enqueue(mac, &packet);
            return;
        }

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            warn!(iface = %self.name(), %next_hop, "too many pending resolutions, packet dropped");
            self.metrics.record_tx_drop(&self.name());
            return;
        };
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            let _permit = permit;
            match me.resolver.resolve(next_hop).await {
                Some(mac) => me.enqueue(mac, &packet),
                None => {
                    debug!(iface = %me.name(), %next_hop, "next hop unresolved, packet dropped");
                    me.metrics.record_tx_drop(&me.name());
                }
            }
        });
    }

    fn add_listener(&self, listener: Weak<dyn InterfaceListener<A>>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Weak<dyn InterfaceListener<A>>) {
        self.listeners.remove(listener);
    }

    fn add_promiscuous_listener(&self, listener: Weak<dyn InterfaceListener<A>>) {
        self.listeners.add_promiscuous(listener);
    }

    fn remove_promiscuous_listener(&self, listener: &Weak<dyn InterfaceListener<A>>) {
        self.listeners.remove_promiscuous(listener);
    }

    fn close(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            info!(iface = %self.name(), "ethernet interface down");
        }
        self.listeners.clear();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl<A: LinkFamily, C: Capture> Drop for EthInterface<A, C> {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MemoryHub, MemoryPort};
    use crate::protocol::ipv4::{Ipv4Builder, Ipv4Packet, Protocol};
    use crate::protocol::ipv6::Ipv6Builder;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<Vec<u8>>>,
    }

    impl<A: IpAddress> InterfaceListener<A> for Recorder {
        fn on_incoming_packet(&self, _iface: &InterfaceRef<A>, packet: &[u8]) {
            self.packets.lock().unwrap().push(packet.to_vec());
        }
    }

    fn listen<A: LinkFamily>(iface: &Arc<EthInterface<A, MemoryPort>>) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        iface.add_listener(Arc::downgrade(&recorder) as Weak<dyn InterfaceListener<A>>);
        recorder
    }

    async fn wait_for(recorder: &Recorder, count: usize) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while recorder.packets.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    fn v4_pair(hub: &Arc<MemoryHub>) -> (Arc<Ipv4EthInterface<MemoryPort>>, Arc<Ipv4EthInterface<MemoryPort>>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let a = EthInterface::spawn(
            EthConfig::new("a", MacAddr::local(1), ResolverConfig::ipv4()),
            hub.port(),
            metrics.clone(),
        )
        .unwrap();
        let b = EthInterface::spawn(
            EthConfig::new("b", MacAddr::local(2), ResolverConfig::ipv4()),
            hub.port(),
            metrics,
        )
        .unwrap();
        a.add_address("10.0.0.1/24".parse().unwrap());
        b.add_address("10.0.0.2/24".parse().unwrap());
        (a, b)
    }

    fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        Ipv4Builder::new()
            .protocol(Protocol::Udp as u8)
            .src_addr(src)
            .dst_addr(dst)
            .payload(&[0, 1, 0, 2, 0, 8, 0, 0])
            .build()
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let hub = MemoryHub::new();
        let result = Ipv4EthInterface::spawn(
            EthConfig::new("x", MacAddr::local(9), ResolverConfig::ipv4()),
            hub.port(),
            Arc::new(MetricsRegistry::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_ipv4_send_resolves_through_arp() {
        let hub = MemoryHub::new();
        let (a, b) = v4_pair(&hub);
        let recorder = listen(&b);
        let dst = Ipv4Addr::new(10, 0, 0, 2);

        a.send(udp_packet(Ipv4Addr::new(10, 0, 0, 1), dst), dst);

        assert!(wait_for(&recorder, 1).await);
        let packet = Ipv4Packet::from_bytes(&recorder.packets.lock().unwrap()[0]).unwrap();
        assert_eq!(packet.dst_addr(), dst);
        assert_eq!(a.resolver().cache_entries(), vec![(dst, MacAddr::local(2))]);
    }

    #[tokio::test]
    async fn test_broadcast_needs_no_resolution() {
        let hub = MemoryHub::new();
        let (a, b) = v4_pair(&hub);
        let recorder = listen(&b);

        a.send(
            udp_packet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::BROADCAST),
            Ipv4Addr::BROADCAST,
        );

        assert!(wait_for(&recorder, 1).await);
        assert!(a.resolver().cache_entries().is_empty());
    }

    #[tokio::test]
    async fn test_frames_for_other_hosts_are_promiscuous_only() {
        let hub = MemoryHub::new();
        let (_a, b) = v4_pair(&hub);
        let normal = listen(&b);
        let spy = Arc::new(Recorder::default());
        b.add_promiscuous_listener(Arc::downgrade(&spy) as Weak<dyn InterfaceListener<Ipv4Addr>>);

        let stranger = hub.port();
        let frame = build_frame(
            MacAddr::local(77),
            MacAddr::local(3),
            EtherType::Ipv4,
            &udp_packet(Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(10, 0, 0, 77)),
        );
        stranger.send(&frame).await.unwrap();

        assert!(wait_for(&spy, 1).await);
        assert!(normal.packets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_interface_drops() {
        let hub = MemoryHub::new();
        let (a, b) = v4_pair(&hub);
        let recorder = listen(&b);
        b.close();

        a.send(
            udp_packet(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::BROADCAST),
            Ipv4Addr::BROADCAST,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.packets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_send_resolves_through_nd() {
        let hub = MemoryHub::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let a = Ipv6EthInterface::spawn(
            EthConfig::new("a", MacAddr::local(1), ResolverConfig::ipv6()),
            hub.port(),
            metrics.clone(),
        )
        .unwrap();
        let b = Ipv6EthInterface::spawn(
            EthConfig::new("b", MacAddr::local(2), ResolverConfig::ipv6()),
            hub.port(),
            metrics,
        )
        .unwrap();
        a.add_address("2001:db8::1/64".parse().unwrap());
        b.add_address("2001:db8::2/64".parse().unwrap());
        let recorder = listen(&b);

        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let packet = Ipv6Builder::new()
            .src_addr("2001:db8::1".parse().unwrap())
            .dst_addr(dst)
            .next_header(Protocol::Udp as u8)
            .payload(&[0, 1, 0, 2, 0, 8, 0, 0])
            .build();
        a.send(packet, dst);

        assert!(wait_for(&recorder, 1).await);
        let received = Ipv6Packet::from_bytes(&recorder.packets.lock().unwrap()[0]).unwrap();
        assert_eq!(received.dst_addr(), dst);
        assert_eq!(a.resolver().cache_entries(), vec![(dst, MacAddr::local(2))]);
    }
}
