//! Peer identifiers.
//!
//! A `PeerId` is 160 bits rendered as 40 lowercase hex characters. The
//! "XOR distance" between two ids is the sum of the nibble-wise XOR across
//! both hex strings — a deliberate non-standard ordering preserved from the
//! source fabric for interop. It is used only to pick overlay neighbors and
//! relay fan-out targets; it is not a metric in the mathematical sense and
//! must not be treated as one (no triangle inequality, no DHT key space).

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const PEER_ID_BYTES: usize = 20;
pub const PEER_ID_HEX_LEN: usize = PEER_ID_BYTES * 2;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; PEER_ID_BYTES]);

impl PeerId {
    /// Generate a fresh random id (used for this hub's own hub-mesh identity).
    pub fn generate() -> Self {
        let mut bytes = [0u8; PEER_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Validate and parse a 40-hex-character string.
    pub fn validate(s: &str) -> Result<Self, PeerIdError> {
        if s.len() != PEER_ID_HEX_LEN {
            return Err(PeerIdError::WrongLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PeerIdError::NotHex);
        }
        let mut bytes = [0u8; PEER_ID_BYTES];
        hex::decode_to_slice(s.to_ascii_lowercase(), &mut bytes).map_err(|_| PeerIdError::NotHex)?;
        Ok(Self(bytes))
    }

    /// Sum of the nibble-wise XOR between two ids' hex representations.
    /// Ordering-only; never use as a real distance metric.
    pub fn xor_distance(&self, other: &PeerId) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| {
                let x = a ^ b;
                ((x >> 4) & 0x0f) as u32 + (x & 0x0f) as u32
            })
            .sum()
    }

    /// The `k` candidates closest to `target`, stable-sorted by distance
    /// then lexicographically. Used for overlay routing only.
    pub fn closest<'a>(target: &PeerId, candidates: &'a [PeerId], k: usize) -> Vec<&'a PeerId> {
        let mut scored: Vec<(u32, &PeerId)> =
            candidates.iter().map(|c| (target.xor_distance(c), c)).collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().take(k).map(|(_, id)| id).collect()
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::validate(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = PeerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::validate(&value)
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdError {
    #[error("peerId must be exactly {} hex characters, got {0}", PEER_ID_HEX_LEN)]
    WrongLength(usize),
    #[error("peerId must be hex-only")]
    NotHex,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> PeerId {
        PeerId([byte; PEER_ID_BYTES])
    }

    #[test]
    fn validates_correct_length_and_alphabet() {
        let s = "a".repeat(PEER_ID_HEX_LEN);
        assert!(PeerId::validate(&s).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            PeerId::validate("abc"),
            Err(PeerIdError::WrongLength(3))
        ));
    }

    #[test]
    fn rejects_non_hex() {
        let s = "z".repeat(PEER_ID_HEX_LEN);
        assert!(matches!(PeerId::validate(&s), Err(PeerIdError::NotHex)));
    }

    #[test]
    fn round_trips_through_display() {
        let clean = "a1b2c3d4e5a1b2c3d4e5a1b2c3d4e5a1b2c3d4e5";
        assert_eq!(clean.len(), PEER_ID_HEX_LEN);
        let parsed = PeerId::validate(clean).unwrap();
        assert_eq!(parsed.to_string(), clean);
    }

    #[test]
    fn xor_distance_is_zero_for_identical_ids() {
        let a = id(0xAB);
        assert_eq!(a.xor_distance(&a), 0);
    }

    #[test]
    fn xor_distance_is_symmetric() {
        let a = id(0x0F);
        let b = id(0xF0);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
    }

    #[test]
    fn closest_orders_by_distance_then_lexicographic() {
        let target = id(0x00);
        let near = PeerId([0x01; PEER_ID_BYTES]);
        let far = PeerId([0xFF; PEER_ID_BYTES]);
        let candidates = vec![far, near];
        let closest = PeerId::closest(&target, &candidates, 1);
        assert_eq!(closest[0], &near);
    }

    #[test]
    fn generate_produces_valid_ids() {
        let generated = PeerId::generate();
        let round_tripped = PeerId::validate(&generated.to_string()).unwrap();
        assert_eq!(generated, round_tripped);
    }
}
