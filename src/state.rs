//! Aggregate hub state.
//!
//! `HubState` is the single `Arc`-shared handle passed to every connection
//! task, the Router, BootstrapConnector, HubMeshClient, and MigrationController.
//! Each table inside guards its own keys (DashMap-per-shard); cross-table
//! sequencing (e.g. removing a peer from both ConnectionTable and
//! NetworkIndex) is done by one function so no other task observes a
//! half-updated state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::HubConfig;
use crate::connection_table::ConnectionTable;
use crate::events::EventBus;
use crate::hub_registry::HubRegistry;
use crate::network_index::NetworkIndex;
use crate::peer_id::PeerId;
use crate::protocol::Frame;
use crate::relay_table::{RelayTable, DEFAULT_RELAY_TTL};
use crate::remote_peer_cache::RemotePeerCache;

/// Outbound half of a live bootstrap or direct hub-to-hub link, keyed by
/// the remote hub's configured URI (bootstrap) or its peerId (direct).
pub type HubLinkSender = mpsc::UnboundedSender<Frame>;

#[derive(Clone)]
pub struct HubState {
    pub config: Arc<HubConfig>,
    pub connections: Arc<ConnectionTable>,
    pub networks: Arc<NetworkIndex>,
    pub hubs: Arc<HubRegistry>,
    pub remote_peers: Arc<RemotePeerCache>,
    pub relay_table: Arc<RelayTable>,
    pub events: Arc<EventBus>,

    /// This hub's own identity when participating as a HubMeshClient.
    pub self_peer_id: Arc<PeerId>,

    /// Outbound bootstrap links, keyed by their configured URI.
    pub bootstrap_links: Arc<DashMap<String, HubLinkSender>>,

    /// Peers already migrated to the overlay, whose bootstrap/direct framed
    /// socket has been deliberately closed (I5: suppress further
    /// bootstrap-fallback for these).
    pub migrated_to_overlay: Arc<DashMap<String, ()>>,

    /// Flips once the overlay has been observed ready and migration acted;
    /// consulted by Router's I5 suppression check.
    pub overlay_migrated: Arc<AtomicBool>,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        let peer_timeout = Duration::from_secs(config.peer_timeout_secs);
        let remote_peer_max_age = Duration::from_secs(config.peer_timeout_secs);
        Self {
            config: Arc::new(config),
            connections: Arc::new(ConnectionTable::new(peer_timeout)),
            networks: Arc::new(NetworkIndex::new()),
            hubs: Arc::new(HubRegistry::new()),
            remote_peers: Arc::new(RemotePeerCache::new(remote_peer_max_age)),
            relay_table: Arc::new(RelayTable::new(DEFAULT_RELAY_TTL)),
            events: Arc::new(EventBus::new()),
            self_peer_id: Arc::new(PeerId::generate()),
            bootstrap_links: Arc::new(DashMap::new()),
            migrated_to_overlay: Arc::new(DashMap::new()),
            overlay_migrated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn has_migrated_to_overlay(&self, peer_id: &str) -> bool {
        self.migrated_to_overlay.contains_key(peer_id)
    }

    pub fn mark_migrated_to_overlay(&self, peer_id: &str) {
        self.migrated_to_overlay.insert(peer_id.to_string(), ());
        self.overlay_migrated.store(true, Ordering::Release);
    }

    /// Periodic liveness sweep: reap dead/idle connections and expired
    /// cache/relay entries. Returns the peerIds reaped from ConnectionTable
    /// so the caller can emit `peerDisconnected` for each.
    pub fn sweep(&self) -> Vec<String> {
        self.relay_table.sweep();
        self.remote_peers.prune_expired();
        self.connections.sweep()
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self::new(HubConfig::for_test())
    }
}
