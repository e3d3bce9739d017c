//! Tracks every locally connected socket: clients and direct hub-to-hub
//! framed links alike. A "socket" here is the sender half of a per-connection
//! channel plus a liveness flag the owning connection task flips on close —
//! there is no real transport handle in the table itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::Frame;

/// Outbound half of a connection's write channel. Cloning is cheap; every
/// clone shares the same liveness flag.
#[derive(Clone)]
pub struct PeerSocket {
    sender: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
    pub is_hub: bool,
}

impl PeerSocket {
    pub fn new(sender: mpsc::UnboundedSender<Frame>, is_hub: bool) -> Self {
        Self { sender, closed: Arc::new(AtomicBool::new(false)), is_hub }
    }

    pub fn mark_as_hub(&mut self) {
        self.is_hub = true;
    }

    /// Enqueue a frame for delivery. Per the backpressure model, a failed
    /// send just means the peer is already gone; the caller logs and moves
    /// on rather than treating it as fatal.
    pub fn send(&self, frame: Frame) -> Result<(), Frame> {
        self.sender.send(frame.clone()).map_err(|_| frame)
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// Flipped by the owning connection task's teardown path.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct LocalPeer {
    socket: PeerSocket,
    network_name: Option<String>,
    data: Option<Value>,
    last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Added,
    DuplicateDisplacingStale,
    Rejected,
}

/// Registry of every peerId this hub has an open (or recently-open) socket
/// for. Table mutations are expected to come from a single logical writer
/// per key; DashMap's per-shard locking makes concurrent reads and
/// cross-key writes safe without a global lock.
pub struct ConnectionTable {
    peers: DashMap<String, LocalPeer>,
    peer_timeout: Duration,
}

impl ConnectionTable {
    pub fn new(peer_timeout: Duration) -> Self {
        Self { peers: DashMap::new(), peer_timeout }
    }

    pub fn add(&self, peer_id: &str, socket: PeerSocket) -> AddResult {
        if let Some(existing) = self.peers.get(peer_id) {
            if existing.socket.is_open() {
                return AddResult::Rejected;
            }
        }
        let was_displaced = self.peers.contains_key(peer_id);
        self.peers.insert(
            peer_id.to_string(),
            LocalPeer { socket, network_name: None, data: None, last_seen: Instant::now() },
        );
        if was_displaced {
            AddResult::DuplicateDisplacingStale
        } else {
            AddResult::Added
        }
    }

    pub fn remove(&self, peer_id: &str) -> bool {
        if let Some((_, peer)) = self.peers.remove(peer_id) {
            peer.socket.mark_closed();
            true
        } else {
            false
        }
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn socket(&self, peer_id: &str) -> Option<PeerSocket> {
        self.peers.get(peer_id).map(|p| p.socket.clone())
    }

    pub fn network_of(&self, peer_id: &str) -> Option<String> {
        self.peers.get(peer_id).and_then(|p| p.network_name.clone())
    }

    pub fn set_network(&self, peer_id: &str, network_name: impl Into<String>) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.network_name = Some(network_name.into());
        }
    }

    pub fn set_data(&self, peer_id: &str, data: Value) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.data = Some(data);
        }
    }

    pub fn data_of(&self, peer_id: &str) -> Option<Value> {
        self.peers.get(peer_id).and_then(|p| p.data.clone())
    }

    /// Flips a live entry's `isHub` flag once its announce reveals it, the
    /// same moment `HubRegistry::register` runs (I1).
    pub fn mark_as_hub(&self, peer_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.socket.mark_as_hub();
        }
    }

    pub fn touch(&self, peer_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = Instant::now();
        }
    }

    pub fn is_hub(&self, peer_id: &str) -> bool {
        self.peers.get(peer_id).map(|p| p.socket.is_hub).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Closed sockets and idle-too-long sockets are both reaped. Returns the
    /// ids removed, so the caller can emit `peerDisconnected` for each.
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| {
                !entry.value().socket.is_open()
                    || now.duration_since(entry.value().last_seen) > self.peer_timeout
            })
            .map(|entry| entry.key().clone())
            .collect();
        for peer_id in &stale {
            self.remove(peer_id);
        }
        stale
    }
}
