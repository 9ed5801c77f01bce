//! Link-address resolution client
//!
//! One `ResolverClient` serves ARP (IPv4) and Neighbor Discovery (IPv6);
//! the family-specific part is the `Solicitor` that puts the request on
//! the wire. Replies are fed back through `on_reply` by the interface
//! receive loop.

use super::interface::IfAddr;
use super::{lock, read, write};
use crate::protocol::{IpAddress, MacAddr};
use crate::telemetry::MetricsRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// None disables the cache
    pub cache_timeout: Option<Duration>,
    pub retransmit_timeout: Duration,
    pub max_attempts: u32,
}

impl ResolverConfig {
    pub fn ipv4() -> Self {
        Self {
            cache_timeout: Some(Duration::from_millis(20_000)),
            retransmit_timeout: Duration::from_millis(3_000),
            max_attempts: 3,
        }
    }

    pub fn ipv6() -> Self {
        Self {
            cache_timeout: Some(Duration::from_millis(60_000)),
            ..Self::ipv4()
        }
    }
}

/// Puts one resolution request for `target` on the wire, sent from `source`.
pub trait Solicitor<A>: Send + Sync {
    fn solicit(&self, target: A, source: A);
}

/// Resolved link addresses with their age
#[derive(Debug)]
pub struct ResolutionCache<A> {
    entries: HashMap<A, (MacAddr, Instant)>,
    timeout: Duration,
}

impl<A: IpAddress> ResolutionCache<A> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Entry younger than the timeout. An expired entry is evicted.
    pub fn get(&mut self, addr: A) -> Option<MacAddr> {
        let (mac, stamp) = *self.entries.get(&addr)?;
        if Instant::now() < stamp + self.timeout {
            Some(mac)
        } else {
            self.entries.remove(&addr);
            None
        }
    }

    pub fn insert(&mut self, addr: A, mac: MacAddr) {
        self.entries.insert(addr, (mac, Instant::now()));
    }

    pub fn remove(&mut self, addr: A) -> bool {
        self.entries.remove(&addr).is_some()
    }

    pub fn entries(&self) -> Vec<(A, MacAddr)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(a, (m, _))| (*a, *m)).collect();
        entries.sort();
        entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type Pending<A> = Option<(A, oneshot::Sender<MacAddr>)>;

/// Clears the pending slot when a resolution ends or its future is dropped.
struct PendingGuard<'a, A> {
    slot: &'a Mutex<Pending<A>>,
}

impl<A> Drop for PendingGuard<'_, A> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

pub struct ResolverClient<A: IpAddress> {
    config: ResolverConfig,
    mac: MacAddr,
    addresses: RwLock<Vec<IfAddr<A>>>,
    cache: Option<Mutex<ResolutionCache<A>>>,
    pending: Mutex<Pending<A>>,
    serial: tokio::sync::Mutex<()>,
    solicitor: Arc<dyn Solicitor<A>>,
    metrics: Arc<MetricsRegistry>,
}

impl<A: IpAddress> ResolverClient<A> {
    pub fn new(
        config: ResolverConfig,
        mac: MacAddr,
        solicitor: Arc<dyn Solicitor<A>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            mac,
            addresses: RwLock::new(Vec::new()),
            cache: config
                .cache_timeout
                .map(|t| Mutex::new(ResolutionCache::new(t))),
            pending: Mutex::new(None),
            serial: tokio::sync::Mutex::new(()),
            solicitor,
            metrics,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Link address of the interface this client resolves for
    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn add_address(&self, addr: IfAddr<A>) {
        let mut addresses = write(&self.addresses);
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }

    pub fn remove_address(&self, addr: A) -> bool {
        let mut addresses = write(&self.addresses);
        let before = addresses.len();
        addresses.retain(|a| a.addr != addr);
        addresses.len() != before
    }

    pub fn addresses(&self) -> Vec<IfAddr<A>> {
        read(&self.addresses).clone()
    }

    /// Unicast address owned by this interface; the servers answer for these.
    pub fn owns(&self, addr: A) -> bool {
        read(&self.addresses)
            .iter()
            .any(|a| a.is_unicast() && a.addr == addr)
    }

    /// Group and broadcast destinations map to fixed link addresses.
    fn well_known(&self, target: A) -> Option<MacAddr> {
        if target.is_limited_broadcast() {
            return Some(MacAddr::BROADCAST);
        }
        if target.is_multicast() {
            return Some(target.multicast_mac());
        }
        // directed broadcast only exists for IPv4
        if A::BITS == 32 {
            let directed = read(&self.addresses).iter().any(|a| {
                a.is_unicast()
                    && a.prefix()
                        .is_some_and(|p| p.len() < A::BITS && p.directed_broadcast() == target)
            });
            if directed {
                return Some(MacAddr::BROADCAST);
            }
        }
        None
    }

    /// Resolution that needs no traffic: well-known or cached.
    pub fn lookup_cached(&self, target: A) -> Option<MacAddr> {
        if let Some(mac) = self.well_known(target) {
            return Some(mac);
        }
        let mac = self.cache.as_ref().and_then(|c| lock(c).get(target));
        if mac.is_some() {
            self.metrics.resolution_cache_hits.inc();
        }
        mac
    }

    /// Local unicast address on the same prefix as `target`
    fn source_for(&self, target: A) -> Option<A> {
        read(&self.addresses)
            .iter()
            .filter(|a| a.is_unicast())
            .find(|a| a.prefix().is_some_and(|p| p.contains(target)))
            .map(|a| a.addr)
    }

    /// Resolve `target`, retransmitting up to `max_attempts` times.
    pub async fn resolve(&self, target: A) -> Option<MacAddr> {
        if let Some(mac) = self.lookup_cached(target) {
            return Some(mac);
        }
        let Some(source) = self.source_for(target) else {
            debug!(family = A::FAMILY, %target, "no local prefix contains target");
            self.metrics.resolution_failures.inc();
            return None;
        };

        let _serial = self.serial.lock().await;
        // another resolution may have filled the cache meanwhile
        if let Some(mac) = self.lookup_cached(target) {
            return Some(mac);
        }

        let (tx, mut rx) = oneshot::channel();
        *lock(&self.pending) = Some((target, tx));
        let _guard = PendingGuard { slot: &self.pending };

        for attempt in 1..=self.config.max_attempts {
            trace!(family = A::FAMILY, %target, %source, attempt, "soliciting");
            self.solicitor.solicit(target, source);
            self.metrics.resolution_requests_sent.inc();

            match timeout(self.config.retransmit_timeout, &mut rx).await {
                Ok(Ok(mac)) => {
                    debug!(family = A::FAMILY, %target, %mac, "resolved");
                    return Some(mac);
                }
                Ok(Err(_)) => break,
                Err(_) => continue,
            }
        }

        debug!(family = A::FAMILY, %target, "resolution failed");
        self.metrics.resolution_failures.inc();
        None
    }

    /// Feed a reply seen on the wire. Only the pending request is
    /// satisfied; returns true if the reply answered it.
    pub fn on_reply(&self, addr: A, mac: MacAddr) -> bool {
        let mut pending = lock(&self.pending);
        if !matches!(pending.as_ref(), Some((target, _)) if *target == addr) {
            trace!(family = A::FAMILY, %addr, %mac, "ignoring unsolicited reply");
            return false;
        }
        if let Some(cache) = &self.cache {
            lock(cache).insert(addr, mac);
        }
        if let Some((_, tx)) = pending.take() {
            let _ = tx.send(mac);
        }
        true
    }

    pub fn cache_entries(&self) -> Vec<(A, MacAddr)> {
        self.cache
            .as_ref()
            .map(|c| lock(c).entries())
            .unwrap_or_default()
    }

    pub fn clear_cache(&self) {
        if let Some(cache) = &self.cache {
            lock(cache).clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Weak;

    /// Records solicitations; optionally answers them right away.
    struct Recorder {
        sent: Mutex<Vec<(Ipv4Addr, Ipv4Addr)>>,
        client: Mutex<Weak<ResolverClient<Ipv4Addr>>>,
        answer: Option<MacAddr>,
    }

    impl Solicitor<Ipv4Addr> for Recorder {
        fn solicit(&self, target: Ipv4Addr, source: Ipv4Addr) {
            self.sent.lock().unwrap().push((target, source));
            if let (Some(mac), Some(client)) = (self.answer, self.client.lock().unwrap().upgrade()) {
                client.on_reply(target, mac);
            }
        }
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    const PEER: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x22]);

    fn client(answer: Option<MacAddr>) -> (Arc<ResolverClient<Ipv4Addr>>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(Vec::new()),
            client: Mutex::new(Weak::new()),
            answer,
        });
        let client = Arc::new(ResolverClient::new(
            ResolverConfig::ipv4(),
            MacAddr::local(1),
            recorder.clone(),
            Arc::new(MetricsRegistry::new()),
        ));
        client.add_address("10.0.0.1/24".parse().unwrap());
        *recorder.client.lock().unwrap() = Arc::downgrade(&client);
        (client, recorder)
    }

    #[tokio::test]
    async fn test_well_known_addresses() {
        let (client, recorder) = client(None);
        assert_eq!(client.resolve(Ipv4Addr::BROADCAST).await, Some(MacAddr::BROADCAST));
        assert_eq!(client.resolve(addr("10.0.0.255")).await, Some(MacAddr::BROADCAST));
        assert_eq!(
            client.resolve(addr("224.0.0.1")).await,
            Some(MacAddr([0x01, 0x00, 0x5e, 0, 0, 1]))
        );
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_off_link_target_fails_immediately() {
        let (client, recorder) = client(None);
        assert_eq!(client.resolve(addr("192.168.1.1")).await, None);
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_then_cached() {
        let (client, recorder) = client(Some(PEER));
        assert_eq!(client.resolve(addr("10.0.0.2")).await, Some(PEER));
        assert_eq!(client.resolve(addr("10.0.0.2")).await, Some(PEER));

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(addr("10.0.0.2"), addr("10.0.0.1"))]);
        assert_eq!(client.cache_entries(), vec![(addr("10.0.0.2"), PEER)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiry_triggers_new_request() {
        let (client, recorder) = client(Some(PEER));
        client.resolve(addr("10.0.0.2")).await;
        tokio::time::advance(Duration::from_millis(20_001)).await;
        client.resolve(addr("10.0.0.2")).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_gives_up() {
        let (client, recorder) = client(None);
        let started = Instant::now();
        assert_eq!(client.resolve(addr("10.0.0.9")).await, None);
        assert_eq!(recorder.sent.lock().unwrap().len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(9_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_completes_resolution() {
        let (client, recorder) = client(None);
        let resolving = {
            let client = client.clone();
            tokio::spawn(async move { client.resolve(addr("10.0.0.2")).await })
        };

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(client.on_reply(addr("10.0.0.2"), PEER));
        assert_eq!(resolving.await.unwrap(), Some(PEER));
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unsolicited_reply_ignored() {
        let (client, _recorder) = client(None);
        assert!(!client.on_reply(addr("10.0.0.7"), PEER));
        assert!(client.cache_entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_resolution_clears_pending() {
        let (client, _recorder) = client(None);
        let attempt = timeout(Duration::from_millis(100), client.resolve(addr("10.0.0.2"))).await;
        assert!(attempt.is_err());
        assert!(!client.on_reply(addr("10.0.0.2"), PEER));
    }

    #[test]
    fn test_owns_unicast_only() {
        let (client, _recorder) = client(None);
        client.add_address(IfAddr::broadcast(addr("10.0.0.255")));
        assert!(client.owns(addr("10.0.0.1")));
        assert!(!client.owns(addr("10.0.0.255")));
        assert!(client.remove_address(addr("10.0.0.1")));
        assert!(!client.owns(addr("10.0.0.1")));
    }
}
