//! Multi-node tests over in-memory links and hubs
//!
//! Run with: cargo test --test topology

mod ethernet;
mod forwarding;
mod nat;
mod net;
