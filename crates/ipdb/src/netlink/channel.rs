//! In-memory datagram endpoint.
//!
//! A [`ChannelEndpoint`] stands in for a kernel socket: whatever the
//! connection sends shows up at the [`ChannelPeer`], and whatever the peer
//! sends is read back by the connection as a datagram. Replay tools and the
//! test suite use it to drive a [`Connection`](super::Connection) without
//! touching the kernel.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::error::{Error, Result};

/// Connection side of an in-memory datagram pair.
#[derive(Debug)]
pub struct ChannelEndpoint {
    pid: u32,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    groups: AtomicU64,
}

/// Far side of an in-memory datagram pair.
#[derive(Debug)]
pub struct ChannelPeer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Create a connected endpoint/peer pair. `pid` is the port id the
/// endpoint reports and stamps into outgoing headers.
pub fn pair(pid: u32) -> (ChannelEndpoint, ChannelPeer) {
    let (to_peer, from_endpoint) = mpsc::unbounded_channel();
    let (to_endpoint, from_peer) = mpsc::unbounded_channel();
    (
        ChannelEndpoint {
            pid,
            tx: to_peer,
            rx: Mutex::new(from_peer),
            groups: AtomicU64::new(0),
        },
        ChannelPeer {
            tx: to_endpoint,
            rx: from_endpoint,
        },
    )
}

impl ChannelEndpoint {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Groups requested through `bind`.
    pub fn groups(&self) -> u64 {
        self.groups.load(Ordering::Relaxed)
    }

    pub(crate) fn bind(&self, groups: u64) {
        self.groups.fetch_or(groups, Ordering::Relaxed);
    }

    pub(crate) fn send(&self, data: &[u8]) -> Result<()> {
        self.tx.send(data.to_vec()).map_err(|_| Error::SocketClosed)
    }

    pub(crate) async fn recv(&self) -> Result<Vec<u8>> {
        self.rx.lock().await.recv().await.ok_or(Error::SocketClosed)
    }
}

impl ChannelPeer {
    /// Deliver a datagram to the endpoint.
    pub fn send(&self, data: Vec<u8>) -> Result<()> {
        self.tx.send(data).map_err(|_| Error::SocketClosed)
    }

    /// A handle that can deliver datagrams from other tasks.
    pub fn sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.tx.clone()
    }

    /// Next datagram written by the endpoint, `None` once it is dropped.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}
