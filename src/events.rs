//! Public event surface. External callers (tests, embedding code, the
//! standalone binary's own startup banner) subscribe via
//! `HubState::events.subscribe()` rather than polling state.

use serde::Serialize;
use tokio::sync::broadcast;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HubEvent {
    Started { port: u16 },
    Stopped,
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    PeerAnnounced { peer_id: String, network_name: String },
    PeerGoodbye { peer_id: String },
    HubRegistered { peer_id: String },
    HubUnregistered { peer_id: String },
    HubDiscovered { peer_id: String },
    HubP2pConnected { peer_id: String },
    HubP2pDisconnected { peer_id: String },
    HubMeshReady,
    HubMeshMigrated,
    BootstrapConnected { uri: String },
    BootstrapDisconnected { uri: String },
    Error { reason: String },
}

/// Thin wrapper around a broadcast sender: emitting to zero subscribers
/// never fails and never blocks.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: HubEvent) {
        // A send error just means nobody is currently subscribed.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
