//! In-process Ethernet hub
//!
//! Every frame sent on a `MemoryPort` is repeated to all other ports of the
//! same hub, like a shared segment. No MAC learning.

use super::{Capture, RxInfo};
use crate::dataplane::lock;
use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MemoryHub {
    ports: Mutex<Vec<(usize, mpsc::UnboundedSender<Vec<u8>>)>>,
    next_id: Mutex<usize>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Plug a new port into the hub.
    pub fn port(self: &Arc<Self>) -> MemoryPort {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut next = lock(&self.next_id);
            *next += 1;
            *next
        };
        lock(&self.ports).push((id, tx));
        MemoryPort {
            id,
            hub: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn port_count(&self) -> usize {
        lock(&self.ports).len()
    }

    fn repeat(&self, from: usize, frame: &[u8]) {
        for (id, tx) in lock(&self.ports).iter() {
            if *id != from {
                // a port whose receiver is gone just misses the frame
                let _ = tx.send(frame.to_vec());
            }
        }
    }

    fn unplug(&self, id: usize) {
        lock(&self.ports).retain(|(port, _)| *port != id);
    }
}

pub struct MemoryPort {
    id: usize,
    hub: Arc<MemoryHub>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryPort {
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl Drop for MemoryPort {
    fn drop(&mut self) {
        self.hub.unplug(self.id);
    }
}

impl Capture for MemoryPort {
    async fn recv(&self, buf: &mut [u8]) -> Result<RxInfo> {
        let frame = self.rx.lock().await.recv().await.ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "hub port unplugged",
            ))
        })?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(RxInfo { len, vlan_id: None })
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.hub.repeat(self.id, buf);
        Ok(buf.len())
    }
}
