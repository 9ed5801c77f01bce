//! Metrics collection for packet statistics.
//!
//! Provides thread-safe counters for tracking packet processing metrics
//! at both the global and per-interface level.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-interface statistics.
#[derive(Debug, Default)]
pub struct InterfaceStats {
    pub rx_packets: Counter,
    pub rx_bytes: Counter,
    pub tx_packets: Counter,
    pub tx_bytes: Counter,
    /// Packets received but discarded (malformed, unknown ethertype, ...)
    pub rx_drops: Counter,
    /// Frames dropped before transmission (queue full, unresolved next hop)
    pub tx_drops: Counter,
}

impl InterfaceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }
}

/// Metrics shared by the nodes, NAT and link-address resolution.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    interfaces: RwLock<HashMap<String, InterfaceStats>>,

    // Forwarding
    pub packets_delivered: Counter,
    pub packets_forwarded: Counter,
    /// Packets dropped anywhere in the node (malformed, no route, policy)
    pub packets_dropped: Counter,
    pub ttl_expired: Counter,
    pub no_route: Counter,

    // ICMP
    pub icmp_echo_replies: Counter,
    pub icmp_time_exceeded_sent: Counter,
    pub icmp_dest_unreachable_sent: Counter,

    // NAT
    pub nat_translated_out: Counter,
    pub nat_translated_in: Counter,
    pub nat_dropped: Counter,
    pub nat_pool_exhausted: Counter,

    // Link-address resolution
    pub resolution_requests_sent: Counter,
    pub resolution_replies_sent: Counter,
    pub resolution_cache_hits: Counter,
    pub resolution_failures: Counter,

    // Gauges
    pub nat_entries: AtomicU64,
    pub route_count: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn stats(&self) -> RwLockReadGuard<'_, HashMap<String, InterfaceStats>> {
        self.interfaces.read().unwrap_or_else(|e| e.into_inner())
    }

    fn stats_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, InterfaceStats>> {
        self.interfaces.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers an interface for statistics tracking.
    pub fn register_interface(&self, name: &str) {
        self.stats_mut().entry(name.to_string()).or_default();
    }

    pub fn record_rx(&self, interface: &str, bytes: usize) {
        if let Some(stats) = self.stats().get(interface) {
            stats.record_rx(bytes);
        }
    }

    pub fn record_tx(&self, interface: &str, bytes: usize) {
        if let Some(stats) = self.stats().get(interface) {
            stats.record_tx(bytes);
        }
    }

    pub fn record_rx_drop(&self, interface: &str) {
        if let Some(stats) = self.stats().get(interface) {
            stats.rx_drops.inc();
        }
    }

    pub fn record_tx_drop(&self, interface: &str) {
        if let Some(stats) = self.stats().get(interface) {
            stats.tx_drops.inc();
        }
    }

    pub fn set_nat_entries(&self, count: usize) {
        self.nat_entries.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_route_count(&self, count: usize) {
        self.route_count.store(count as u64, Ordering::Relaxed);
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("packets_delivered".into(), self.packets_delivered.get()),
            ("packets_forwarded".into(), self.packets_forwarded.get()),
            ("packets_dropped".into(), self.packets_dropped.get()),
            ("ttl_expired".into(), self.ttl_expired.get()),
            ("no_route".into(), self.no_route.get()),
            ("icmp_echo_replies".into(), self.icmp_echo_replies.get()),
            (
                "icmp_time_exceeded_sent".into(),
                self.icmp_time_exceeded_sent.get(),
            ),
            (
                "icmp_dest_unreachable_sent".into(),
                self.icmp_dest_unreachable_sent.get(),
            ),
            ("nat_translated_out".into(), self.nat_translated_out.get()),
            ("nat_translated_in".into(), self.nat_translated_in.get()),
            ("nat_dropped".into(), self.nat_dropped.get()),
            ("nat_pool_exhausted".into(), self.nat_pool_exhausted.get()),
            (
                "resolution_requests_sent".into(),
                self.resolution_requests_sent.get(),
            ),
            (
                "resolution_replies_sent".into(),
                self.resolution_replies_sent.get(),
            ),
            (
                "resolution_cache_hits".into(),
                self.resolution_cache_hits.get(),
            ),
            ("resolution_failures".into(), self.resolution_failures.get()),
            ("nat_entries".into(), self.nat_entries.load(Ordering::Relaxed)),
            ("route_count".into(), self.route_count.load(Ordering::Relaxed)),
        ];

        let interfaces = self.stats();
        let mut names: Vec<&String> = interfaces.keys().collect();
        names.sort();
        for name in names {
            let stats = &interfaces[name];
            result.extend([
                (format!("{}_rx_packets", name), stats.rx_packets.get()),
                (format!("{}_rx_bytes", name), stats.rx_bytes.get()),
                (format!("{}_tx_packets", name), stats.tx_packets.get()),
                (format!("{}_tx_bytes", name), stats.tx_bytes.get()),
                (format!("{}_rx_drops", name), stats.rx_drops.get()),
                (format!("{}_tx_drops", name), stats.tx_drops.get()),
            ]);
        }

        result
    }
}
