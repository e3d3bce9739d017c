//! Wire frames.
//!
//! A [`Frame`] is the single vocabulary carried over every framed socket this
//! hub speaks: client connections, bootstrap links, and the hub-mesh overlay
//! all exchange the same `type`-tagged JSON object, distinguished only by
//! which connection class delivered it (see `router`). Unknown `type` values
//! deserialize into [`Frame::Unknown`] rather than failing parse, so the
//! codec can still enforce size limits and the router can reply per its
//! unknown-type rule.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// "system" is the reserved `fromPeerId` used for hub-originated frames that
/// have no client sender (pong replies, error replies, relayed discovery).
pub const SYSTEM_PEER_ID: &str = "system";

/// Fields shared by every frame `type`. Payloads specific to a given `type`
/// (e.g. `peer-announce-relay`'s `peerId`/`peerData`) are nested inside
/// `data` rather than flattened, since the wire schema names `data` as the
/// one opaque extension point and the hub-mesh payloads are themselves
/// optional/advisory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(rename = "networkName", default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,

    #[serde(rename = "fromPeerId", default, skip_serializing_if = "Option::is_none")]
    pub from_peer_id: Option<String>,

    #[serde(rename = "targetPeerId", default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl FramePayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network_name = Some(network.into());
        self
    }

    pub fn with_from(mut self, peer_id: impl Into<String>) -> Self {
        self.from_peer_id = Some(peer_id.into());
        self
    }

    pub fn with_target(mut self, peer_id: impl Into<String>) -> Self {
        self.target_peer_id = Some(peer_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }
}

/// The complete set of frame `type`s this hub ever sends or receives,
/// client-originated and hub-originated sharing one wire vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Announce(FramePayload),
    Goodbye(FramePayload),
    Offer(FramePayload),
    Answer(FramePayload),
    IceCandidate(FramePayload),
    PeerDiscovered(FramePayload),
    Ping(FramePayload),
    Cleanup(FramePayload),
    Connected(FramePayload),
    Pong(FramePayload),
    PeerDisconnected(FramePayload),
    PeerAnnounceRelay(FramePayload),
    ClientSignalRelay(FramePayload),
    Error(FramePayload),
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// The `type` string this frame serializes under, or `"unknown"`.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Announce(_) => "announce",
            Frame::Goodbye(_) => "goodbye",
            Frame::Offer(_) => "offer",
            Frame::Answer(_) => "answer",
            Frame::IceCandidate(_) => "ice-candidate",
            Frame::PeerDiscovered(_) => "peer-discovered",
            Frame::Ping(_) => "ping",
            Frame::Cleanup(_) => "cleanup",
            Frame::Connected(_) => "connected",
            Frame::Pong(_) => "pong",
            Frame::PeerDisconnected(_) => "peer-disconnected",
            Frame::PeerAnnounceRelay(_) => "peer-announce-relay",
            Frame::ClientSignalRelay(_) => "client-signal-relay",
            Frame::Error(_) => "error",
            Frame::Unknown => "unknown",
        }
    }

    pub fn payload(&self) -> Option<&FramePayload> {
        match self {
            Frame::Announce(p)
            | Frame::Goodbye(p)
            | Frame::Offer(p)
            | Frame::Answer(p)
            | Frame::IceCandidate(p)
            | Frame::PeerDiscovered(p)
            | Frame::Ping(p)
            | Frame::Cleanup(p)
            | Frame::Connected(p)
            | Frame::Pong(p)
            | Frame::PeerDisconnected(p)
            | Frame::PeerAnnounceRelay(p)
            | Frame::ClientSignalRelay(p)
            | Frame::Error(p) => Some(p),
            Frame::Unknown => None,
        }
    }

    pub fn network_name(&self) -> Option<&str> {
        self.payload().and_then(|p| p.network_name.as_deref())
    }

    pub fn target_peer_id(&self) -> Option<&str> {
        self.payload().and_then(|p| p.target_peer_id.as_deref())
    }

    /// Stamp `fromPeerId` and a fresh `timestamp`, as the router does on
    /// every frame it forwards rather than trust the sender's claims.
    pub fn stamped(mut self, from_peer_id: impl Into<String>, timestamp_ms: i64) -> Self {
        if let Some(payload) = self.payload_mut() {
            payload.from_peer_id = Some(from_peer_id.into());
            payload.timestamp = Some(timestamp_ms);
        }
        self
    }

    fn payload_mut(&mut self) -> Option<&mut FramePayload> {
        match self {
            Frame::Announce(p)
            | Frame::Goodbye(p)
            | Frame::Offer(p)
            | Frame::Answer(p)
            | Frame::IceCandidate(p)
            | Frame::PeerDiscovered(p)
            | Frame::Ping(p)
            | Frame::Cleanup(p)
            | Frame::Connected(p)
            | Frame::Pong(p)
            | Frame::PeerDisconnected(p)
            | Frame::PeerAnnounceRelay(p)
            | Frame::ClientSignalRelay(p)
            | Frame::Error(p) => Some(p),
            Frame::Unknown => None,
        }
    }

    pub fn error(reason: impl Into<String>, timestamp_ms: i64) -> Self {
        Frame::Error(
            FramePayload::new()
                .with_from(SYSTEM_PEER_ID)
                .with_data(serde_json::json!({ "message": reason.into() }))
                .with_timestamp(timestamp_ms),
        )
    }

    pub fn pong(timestamp_ms: i64) -> Self {
        Frame::Pong(
            FramePayload::new()
                .with_from(SYSTEM_PEER_ID)
                .with_timestamp(timestamp_ms),
        )
    }
}

/// The `data` payload nested inside a `peer-announce-relay` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnounceRelayData {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    #[serde(rename = "networkName")]
    pub network_name: String,
    #[serde(rename = "peerData", default, skip_serializing_if = "Option::is_none")]
    pub peer_data: Option<Value>,
}

/// The `data` payload nested inside a `client-signal-relay` frame. The
/// wrapped frame is carried verbatim so the far side can re-deliver it
/// without reinterpreting its contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientSignalRelayData {
    #[serde(rename = "targetPeerId")]
    pub target_peer_id: String,
    #[serde(rename = "signalData")]
    pub signal_data: Value,
}

/// Maximum accepted raw frame size, enforced by the connection read loop
/// before any JSON parsing is attempted.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1_048_576;

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame exceeds maximum size of {limit} bytes")]
    TooLarge { limit: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode one text frame, enforcing the size cap first so an oversize frame
/// never reaches the JSON parser.
pub fn decode_frame(raw: &str, max_message_size: usize) -> Result<Frame, FrameDecodeError> {
    if raw.len() > max_message_size {
        return Err(FrameDecodeError::TooLarge { limit: max_message_size });
    }
    Ok(serde_json::from_str(raw)?)
}

pub fn encode_frame(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("Frame serialization is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_round_trips() {
        let frame = Frame::Announce(FramePayload::new().with_network("net1").with_data(serde_json::json!({})));
        let encoded = encode_frame(&frame);
        assert!(encoded.contains("\"type\":\"announce\""));
        let decoded: Frame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn ice_candidate_uses_kebab_case_tag() {
        let frame = Frame::IceCandidate(FramePayload::new());
        let encoded = encode_frame(&frame);
        assert!(encoded.contains("\"type\":\"ice-candidate\""));
    }

    #[test]
    fn unrecognized_type_deserializes_to_unknown() {
        let raw = r#"{"type":"totally-unrecognized","data":{}}"#;
        let decoded: Frame = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded, Frame::Unknown);
    }

    #[test]
    fn oversize_raw_frame_is_rejected_before_parsing() {
        let raw = "x".repeat(100);
        let err = decode_frame(&raw, 10).unwrap_err();
        assert!(matches!(err, FrameDecodeError::TooLarge { limit: 10 }));
    }

    #[test]
    fn malformed_json_is_reported_distinctly() {
        let err = decode_frame("{not json", 1_000_000).unwrap_err();
        assert!(matches!(err, FrameDecodeError::Malformed(_)));
    }

    #[test]
    fn stamped_overwrites_from_and_timestamp() {
        let frame = Frame::Offer(FramePayload::new().with_from("claimed").with_target("b"));
        let stamped = frame.stamped("actual-sender", 1234);
        let payload = stamped.payload().unwrap();
        assert_eq!(payload.from_peer_id.as_deref(), Some("actual-sender"));
        assert_eq!(payload.timestamp, Some(1234));
        assert_eq!(payload.target_peer_id.as_deref(), Some("b"));
    }

    #[test]
    fn peer_announce_relay_data_round_trips_inside_data_field() {
        let inner = PeerAnnounceRelayData {
            peer_id: "a".repeat(40),
            network_name: "net1".to_string(),
            peer_data: None,
        };
        let value = serde_json::to_value(&inner).unwrap();
        let frame = Frame::PeerAnnounceRelay(FramePayload::new().with_data(value.clone()));
        let Frame::PeerAnnounceRelay(payload) = &frame else { panic!("wrong variant") };
        let round_tripped: PeerAnnounceRelayData =
            serde_json::from_value(payload.data.clone().unwrap()).unwrap();
        assert_eq!(round_tripped, inner);
        let _ = value;
    }

    #[test]
    fn client_signal_relay_carries_wrapped_signal_verbatim() {
        let wrapped = serde_json::json!({"type": "offer", "data": {"sdp": "X"}});
        let inner = ClientSignalRelayData {
            target_peer_id: "b".repeat(40),
            signal_data: wrapped.clone(),
        };
        let value = serde_json::to_value(&inner).unwrap();
        let round_tripped: ClientSignalRelayData = serde_json::from_value(value).unwrap();
        assert_eq!(round_tripped.signal_data, wrapped);
    }

    #[test]
    fn pong_and_error_stamp_system_as_sender() {
        assert_eq!(
            Frame::pong(0).payload().unwrap().from_peer_id.as_deref(),
            Some(SYSTEM_PEER_ID)
        );
        assert_eq!(
            Frame::error("nope", 0).payload().unwrap().from_peer_id.as_deref(),
            Some(SYSTEM_PEER_ID)
        );
    }
}
