//! Caches peers learned from other hubs, keyed by the network they were
//! announced into. Consulted whenever a local peer announces, so it can
//! discover peers that live on a different hub entirely.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct RemotePeerEntry {
    pub peer_id: String,
    pub peer_data: Option<Value>,
    seen_at: Instant,
}

/// `network -> peerId -> entry`. A nested DashMap gives per-network shard
/// locking without a global mutex across unrelated networks.
#[derive(Default)]
pub struct RemotePeerCache {
    networks: DashMap<String, DashMap<String, RemotePeerEntry>>,
    max_age: Duration,
}

impl RemotePeerCache {
    pub fn new(max_age: Duration) -> Self {
        Self { networks: DashMap::new(), max_age }
    }

    pub fn insert(&self, network: &str, peer_id: &str, peer_data: Option<Value>) {
        let entry =
            RemotePeerEntry { peer_id: peer_id.to_string(), peer_data, seen_at: Instant::now() };
        self.networks.entry(network.to_string()).or_default().insert(peer_id.to_string(), entry);
    }

    pub fn remove(&self, network: &str, peer_id: &str) {
        if let Some(members) = self.networks.get(network) {
            members.remove(peer_id);
            let empty = members.is_empty();
            drop(members);
            if empty {
                self.networks.remove(network);
            }
        }
    }

    pub fn members(&self, network: &str) -> Vec<RemotePeerEntry> {
        self.networks
            .get(network)
            .map(|members| members.iter().map(|entry| entry.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Remove every entry older than `max_age`. Called from the periodic
    /// liveness sweep alongside `ConnectionTable::sweep`.
    pub fn prune_expired(&self) {
        let now = Instant::now();
        let stale_networks: Vec<String> = self
            .networks
            .iter()
            .filter_map(|network_entry| {
                let members = network_entry.value();
                let stale_ids: Vec<String> = members
                    .iter()
                    .filter(|entry| now.duration_since(entry.value().seen_at) > self.max_age)
                    .map(|entry| entry.key().clone())
                    .collect();
                for id in &stale_ids {
                    members.remove(id);
                }
                if members.is_empty() {
                    Some(network_entry.key().clone())
                } else {
                    None
                }
            })
            .collect();
        for network in stale_networks {
            self.networks.remove(&network);
        }
    }
}
