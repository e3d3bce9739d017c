//! Maps network names to the peerIds currently announced into them.
//!
//! First `attach` wins: a peer keeps whatever network it first announced
//! under for the lifetime of its connection. Empty sets are removed so the
//! index never accumulates abandoned network names.

use dashmap::DashMap;
use dashmap::DashSet;

#[derive(Default)]
pub struct NetworkIndex {
    networks: DashMap<String, DashSet<String>>,
}

impl NetworkIndex {
    pub fn new() -> Self {
        Self { networks: DashMap::new() }
    }

    /// Returns `false` if `peer_id` was already attached to some network
    /// (first announce wins; callers should not re-home a peer).
    pub fn attach(&self, peer_id: &str, network: &str) -> bool {
        let members = self.networks.entry(network.to_string()).or_default();
        members.insert(peer_id.to_string())
    }

    pub fn detach(&self, peer_id: &str, network: &str) {
        if let Some(members) = self.networks.get(network) {
            members.remove(peer_id);
            if members.is_empty() {
                drop(members);
                self.networks.remove(network);
            }
        }
    }

    pub fn members(&self, network: &str) -> Vec<String> {
        self.networks
            .get(network)
            .map(|set| set.iter().map(|id| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn network_count(&self) -> usize {
        self.networks.len()
    }
}
