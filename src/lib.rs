//! ipstack - user-space IP network layer
//!
//! Composable IPv4/IPv6 nodes that route and forward packets, answer ICMP,
//! resolve link addresses through ARP and Neighbor Discovery, and optionally
//! translate addresses with a stateful NAT. Packets travel over synthetic
//! links or raw sockets instead of the kernel stack.

pub mod capture;
pub mod config;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod stack;
pub mod telemetry;

pub use error::{Error, Result};
