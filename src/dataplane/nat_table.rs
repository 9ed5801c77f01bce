//! NAT tracking table and external port pool
//!
//! Mappings are endpoint dependent: an entry ties one internal socket
//! address to one remote socket address through an external socket
//! address. Entries are grouped by remote address, which is the side both
//! directions know.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// Protocols the NAT tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatProtocol {
    Icmp,
    Tcp,
    Udp,
}

impl NatProtocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(NatProtocol::Icmp),
            6 => Some(NatProtocol::Tcp),
            17 => Some(NatProtocol::Udp),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NatProtocol::Icmp => "icmp",
            NatProtocol::Tcp => "tcp",
            NatProtocol::Udp => "udp",
        }
    }
}

/// One tracked flow. For ICMP the port fields carry the echo identifier
/// (internal and external) or zero (remote).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatEntry {
    pub internal: SocketAddrV4,
    pub external: SocketAddrV4,
    pub remote: SocketAddrV4,
    /// External port was taken from the pool
    pub dynamic: bool,
    pub created_at: Instant,
    pub last_seen: Instant,
}

impl NatEntry {
    pub fn new(
        internal: SocketAddrV4,
        external: SocketAddrV4,
        remote: SocketAddrV4,
        dynamic: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            internal,
            external,
            remote,
            dynamic,
            created_at: now,
            last_seen: now,
        }
    }

    fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        now < self.last_seen + timeout
    }
}

/// Tracking table for one protocol
#[derive(Debug)]
pub struct NatTable {
    entries: HashMap<SocketAddrV4, Vec<NatEntry>>,
    timeout: Duration,
    sweep_interval: Duration,
    last_sweep: Instant,
    /// Entries dropped by expiry, waiting for their ports to be reclaimed
    released: Vec<NatEntry>,
}

impl NatTable {
    pub fn new(timeout: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
            sweep_interval,
            last_sweep: Instant::now(),
            released: Vec::new(),
        }
    }

    /// Entry used by `internal` to talk to `remote`. A hit refreshes the
    /// entry; an expired entry is removed instead.
    pub fn lookup_outbound(
        &mut self,
        internal: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Option<NatEntry> {
        self.lookup(remote, |e| e.internal == internal)
    }

    /// Entry reached by `remote` sending to `external`.
    pub fn lookup_inbound(
        &mut self,
        remote: SocketAddrV4,
        external: SocketAddrV4,
    ) -> Option<NatEntry> {
        self.lookup(remote, |e| e.external == external)
    }

    fn lookup<F: Fn(&NatEntry) -> bool>(&mut self, remote: SocketAddrV4, matches: F) -> Option<NatEntry> {
        let now = Instant::now();
        self.sweep_if_due(now);

        let timeout = self.timeout;
        let bucket = self.entries.get_mut(&remote)?;
        let pos = bucket.iter().position(matches)?;

        if bucket[pos].is_live(now, timeout) {
            bucket[pos].last_seen = now;
            return Some(bucket[pos].clone());
        }

        let expired = bucket.remove(pos);
        if bucket.is_empty() {
            self.entries.remove(&remote);
        }
        self.released.push(expired);
        None
    }

    pub fn add(&mut self, entry: NatEntry) {
        self.sweep_if_due(Instant::now());
        self.entries.entry(entry.remote).or_default().push(entry);
    }

    /// Remove the entry with the same addresses as `entry`.
    pub fn remove(&mut self, entry: &NatEntry) -> bool {
        let Some(bucket) = self.entries.get_mut(&entry.remote) else {
            return false;
        };
        let Some(pos) = bucket
            .iter()
            .position(|e| e.internal == entry.internal && e.external == entry.external)
        else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.entries.remove(&entry.remote);
        }
        true
    }

    fn sweep_if_due(&mut self, now: Instant) {
        if now > self.last_sweep + self.sweep_interval {
            self.sweep_at(now);
        }
    }

    /// Drop every expired entry now, returning how many were dropped.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut dropped = 0;
        for bucket in self.entries.values_mut() {
            let (live, expired): (Vec<NatEntry>, Vec<NatEntry>) =
                bucket.drain(..).partition(|e| e.is_live(now, timeout));
            *bucket = live;
            dropped += expired.len();
            self.released.extend(expired);
        }
        self.entries.retain(|_, bucket| !bucket.is_empty());
        self.last_sweep = now;
        dropped
    }

    /// Entries dropped by expiry since the last call.
    pub fn take_released(&mut self) -> Vec<NatEntry> {
        std::mem::take(&mut self.released)
    }

    /// True when a tracked entry, live or not yet swept, translates to `external`.
    pub fn uses_external(&self, external: SocketAddrV4) -> bool {
        self.entries.values().flatten().any(|e| e.external == external)
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<NatEntry> {
        self.entries.values().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Free external ports, handed out from the front.
#[derive(Debug, Clone)]
pub struct PortPool {
    free: VecDeque<u16>,
    first: u16,
    last: u16,
}

impl PortPool {
    pub fn new(first: u16, last: u16) -> Self {
        Self {
            free: (first..=last).collect(),
            first,
            last,
        }
    }

    pub fn take(&mut self) -> Option<u16> {
        self.free.pop_front()
    }

    /// Return a port. Ports outside the range or already free are ignored.
    pub fn release(&mut self, port: u16) {
        if self.in_range(port) && !self.free.contains(&port) {
            self.free.push_back(port);
        }
    }

    /// Withdraw a specific port (for a static mapping).
    pub fn reserve(&mut self, port: u16) -> bool {
        match self.free.iter().position(|p| *p == port) {
            Some(pos) => {
                self.free.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn in_range(&self, port: u16) -> bool {
        (self.first..=self.last).contains(&port)
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sa(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, a), port)
    }

    fn ext(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 1), port)
    }

    #[test]
    fn test_nat_protocol_from_u8() {
        assert_eq!(NatProtocol::from_u8(17), Some(NatProtocol::Udp));
        assert_eq!(NatProtocol::from_u8(6), Some(NatProtocol::Tcp));
        assert_eq!(NatProtocol::from_u8(1), Some(NatProtocol::Icmp));
        assert_eq!(NatProtocol::from_u8(47), None);
    }

    #[test]
    fn test_lookup_both_directions() {
        let mut table = NatTable::new(Duration::from_secs(300), Duration::from_secs(1200));
        let remote = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53);
        table.add(NatEntry::new(sa(2, 5000), ext(6200), remote, true));

        let out = table.lookup_outbound(sa(2, 5000), remote).unwrap();
        assert_eq!(out.external, ext(6200));
        let back = table.lookup_inbound(remote, ext(6200)).unwrap();
        assert_eq!(back.internal, sa(2, 5000));

        // a different remote or internal endpoint has no mapping
        assert!(table.lookup_outbound(sa(3, 5000), remote).is_none());
        assert!(table
            .lookup_inbound(SocketAddrV4::new(Ipv4Addr::new(9, 9, 9, 9), 53), ext(6200))
            .is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expired_entry_removed_on_lookup() {
        let mut table = NatTable::new(Duration::from_millis(5), Duration::from_secs(1200));
        let remote = sa(9, 80);
        table.add(NatEntry::new(sa(2, 5000), ext(6200), remote, true));

        std::thread::sleep(Duration::from_millis(20));

        assert!(table.lookup_outbound(sa(2, 5000), remote).is_none());
        assert!(table.is_empty());
        let released = table.take_released();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].external.port(), 6200);
        assert!(table.take_released().is_empty());
    }

    #[test]
    fn test_lookup_refreshes_entry() {
        let mut table = NatTable::new(Duration::from_millis(200), Duration::from_secs(1200));
        let remote = sa(9, 80);
        table.add(NatEntry::new(sa(2, 5000), ext(6200), remote, true));

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(80));
            assert!(table.lookup_outbound(sa(2, 5000), remote).is_some());
        }
    }

    #[test]
    fn test_sweep_runs_when_due() {
        let mut table = NatTable::new(Duration::from_millis(5), Duration::from_millis(10));
        table.add(NatEntry::new(sa(2, 5000), ext(6200), sa(9, 80), true));
        table.add(NatEntry::new(sa(3, 5000), ext(6201), sa(8, 80), true));

        std::thread::sleep(Duration::from_millis(30));

        // an unrelated lookup triggers the sweep
        assert!(table.lookup_outbound(sa(4, 1), sa(7, 1)).is_none());
        assert!(table.is_empty());
        assert_eq!(table.take_released().len(), 2);
    }

    #[test]
    fn test_remove_entry() {
        let mut table = NatTable::new(Duration::from_secs(300), Duration::from_secs(1200));
        let entry = NatEntry::new(sa(2, 5000), ext(6200), sa(9, 80), true);
        table.add(entry.clone());
        assert!(table.remove(&entry));
        assert!(!table.remove(&entry));
        assert!(table.entries().is_empty());
    }

    #[test]
    fn test_port_pool() {
        let mut pool = PortPool::new(6200, 6202);
        assert_eq!(pool.take(), Some(6200));
        assert!(pool.reserve(6202));
        assert!(!pool.reserve(6202));
        assert_eq!(pool.take(), Some(6201));
        assert_eq!(pool.take(), None);

        pool.release(6200);
        pool.release(6200);
        pool.release(7000);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.take(), Some(6200));
    }
}
