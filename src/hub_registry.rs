//! Tracks which connected peers are themselves hubs.
//!
//! Every entry here must also be present in [`crate::connection_table::ConnectionTable`]
//! marked `isHub` — this registry is a view over that invariant, not a
//! second source of truth for liveness.

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct HubRecord {
    pub peer_id: String,
    pub network_name: Option<String>,
    pub origin: HubOrigin,
}

/// Where this hub connection was observed: a direct client-class socket
/// dialed in over bootstrap, or discovered through hub-mesh announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubOrigin {
    Bootstrap,
    Overlay,
    Direct,
}

#[derive(Default)]
pub struct HubRegistry {
    hubs: DashMap<String, HubRecord>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self { hubs: DashMap::new() }
    }

    pub fn register(&self, record: HubRecord) {
        self.hubs.insert(record.peer_id.clone(), record);
    }

    pub fn unregister(&self, peer_id: &str) -> Option<HubRecord> {
        self.hubs.remove(peer_id).map(|(_, record)| record)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.hubs.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    pub fn all(&self) -> Vec<HubRecord> {
        self.hubs.iter().map(|entry| entry.value().clone()).collect()
    }
}
