//! Forwarding-loop prevention. A [`RelayFingerprint`] identifies "this
//! exact signaling message, already forwarded once" so the router never
//! re-relays the same content twice within the TTL window.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

pub const DEFAULT_RELAY_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayFingerprint(String);

impl RelayFingerprint {
    /// Client signaling fingerprint: `(type, fromPeerId, targetPeerId, hash(data))`.
    pub fn for_signal(
        frame_type: &str,
        from_peer_id: &str,
        target_peer_id: &str,
        data: &impl Serialize,
    ) -> Self {
        Self(format!(
            "{frame_type}:{from_peer_id}:{target_peer_id}:{}",
            rolling_hash(data)
        ))
    }

    /// Peer-announce relay fingerprint: `(peerId, networkName)`.
    pub fn for_announce(peer_id: &str, network_name: &str) -> Self {
        Self(format!("announce:{peer_id}:{network_name}"))
    }
}

/// A 32-bit rolling hash of the serialized payload. Not cryptographic; this
/// only needs to distinguish "same content, already seen" from "different
/// content" within a short TTL window.
fn rolling_hash(value: &impl Serialize) -> u32 {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hash: u32 = 2166136261; // FNV-1a offset basis
    for byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct RelayTable {
    seen: DashMap<RelayFingerprint, Instant>,
    ttl: Duration,
}

impl RelayTable {
    pub fn new(ttl: Duration) -> Self {
        Self { seen: DashMap::new(), ttl }
    }

    /// Returns `true` (and records the fingerprint) the first time this
    /// fingerprint is seen within the TTL window; `false` on every repeat.
    pub fn try_insert(&self, fingerprint: RelayFingerprint) -> bool {
        let now = Instant::now();
        match self.seen.get(&fingerprint) {
            Some(seen_at) if now.duration_since(*seen_at) < self.ttl => false,
            _ => {
                self.seen.insert(fingerprint, now);
                true
            }
        }
    }

    /// Drop entries older than the TTL. Called from the periodic sweep.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_succeeds_repeat_within_ttl_fails() {
        let table = RelayTable::new(Duration::from_secs(5));
        let fp = RelayFingerprint::for_announce("a", "net1");
        assert!(table.try_insert(fp.clone()));
        assert!(!table.try_insert(fp));
    }

    #[test]
    fn insert_succeeds_again_after_ttl_elapses() {
        let table = RelayTable::new(Duration::from_millis(5));
        let fp = RelayFingerprint::for_announce("a", "net1");
        assert!(table.try_insert(fp.clone()));
        std::thread::sleep(Duration::from_millis(15));
        assert!(table.try_insert(fp));
    }

    #[test]
    fn distinct_payloads_produce_distinct_fingerprints() {
        let a = RelayFingerprint::for_signal("offer", "a", "b", &serde_json::json!({"sdp": "X"}));
        let b = RelayFingerprint::for_signal("offer", "a", "b", &serde_json::json!({"sdp": "Y"}));
        assert_ne!(a, b);
    }

    #[test]
    fn sweep_removes_only_expired_fingerprints() {
        let table = RelayTable::new(Duration::from_millis(5));
        table.try_insert(RelayFingerprint::for_announce("a", "net1"));
        std::thread::sleep(Duration::from_millis(15));
        table.try_insert(RelayFingerprint::for_announce("b", "net1"));
        table.sweep();
        assert_eq!(table.len(), 1);
    }
}
