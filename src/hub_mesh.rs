//! This hub participating as a client in its own signaling service.
//!
//! The hub-mesh overlay is this hub dialing the public `/ws` endpoint of
//! other hubs, announcing itself on the reserved mesh namespace, and
//! exchanging frames the same way any client would. There is no separate
//! wire protocol for hub-to-hub overlay traffic; it rides the same `Frame`
//! codec bootstrap links use, carried over a direct WebSocket dial instead
//! of the public signaling surface's own relayed delivery. Real WebRTC data
//! channels and the browser-side mesh library are out of scope; this
//! component exists only to decide *which* other hub gets a given frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::events::HubEvent;
use crate::peer_id::PeerId;
use crate::protocol::{decode_frame, encode_frame, Frame, FramePayload};
use crate::router::{Router, Source};
use crate::state::HubState;

#[derive(Clone)]
struct Neighbor {
    peer_id: PeerId,
    sender: mpsc::UnboundedSender<Frame>,
}

/// Maintains a bounded set of direct overlay links to other hubs and
/// exposes the send/forward operations the Router needs. Holds a handle
/// back to the Router so inbound overlay frames can be routed exactly like
/// any other connection class (see `BootstrapConnector`, which does the
/// same for bootstrap links).
pub struct HubMeshClient {
    state: HubState,
    router: Arc<Router>,
    neighbors: DashMap<String, Neighbor>,
    ready: AtomicBool,
}

impl HubMeshClient {
    pub fn new(state: HubState, router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self { state, router, neighbors: DashMap::new(), ready: AtomicBool::new(false) })
    }

    pub fn is_overlay_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn recompute_readiness(&self) {
        let neighbor_count = self.neighbors.len();
        let known_hubs = self.state.hubs.len();
        let ready = neighbor_count >= self.state.config.hub_mesh_min_peers
            || (known_hubs > 0 && neighbor_count >= known_hubs);
        let was_ready = self.ready.swap(ready, Ordering::AcqRel);
        if ready && !was_ready {
            self.state.events.emit(HubEvent::HubMeshReady);
        }
    }

    /// A new hub announced itself on a local or federated network, carrying
    /// its own reachable `/ws` address in `peerData.capabilities.meshUrl`.
    /// Dial it if we have room and it isn't already a neighbor, favoring
    /// XOR-closer hubs when the window is full.
    pub fn notify_hub_discovered(self: &Arc<Self>, hub_peer_id: &str, peer_data: Option<serde_json::Value>) {
        if self.neighbors.contains_key(hub_peer_id) {
            return;
        }
        let Ok(candidate) = hub_peer_id.parse::<PeerId>() else { return };
        if candidate == *self.state.self_peer_id {
            return;
        }

        if self.neighbors.len() >= self.state.config.hub_mesh_max_peers {
            if !self.should_evict_for(&candidate) {
                return;
            }
            self.evict_farthest_from(&candidate);
        }

        let mesh_url = peer_data
            .as_ref()
            .and_then(|d| d.get("capabilities"))
            .and_then(|c| c.get("meshUrl"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let Some(mesh_url) = mesh_url else {
            debug!(peer_id = hub_peer_id, "hub announcement carried no meshUrl, cannot dial overlay link");
            return;
        };

        self.dial(&mesh_url);
    }

    fn should_evict_for(&self, candidate: &PeerId) -> bool {
        let farthest = self
            .neighbors
            .iter()
            .max_by_key(|entry| entry.value().peer_id.xor_distance(&self.state.self_peer_id));
        match farthest {
            Some(entry) => candidate.xor_distance(&self.state.self_peer_id)
                < entry.value().peer_id.xor_distance(&self.state.self_peer_id),
            None => true,
        }
    }

    fn evict_farthest_from(&self, target: &PeerId) {
        let farthest_key = self
            .neighbors
            .iter()
            .max_by_key(|entry| entry.value().peer_id.xor_distance(target))
            .map(|entry| entry.key().clone());
        if let Some(key) = farthest_key {
            self.neighbors.remove(&key);
            self.state.events.emit(HubEvent::HubP2pDisconnected { peer_id: key });
        }
    }

    /// Open a direct overlay link to another hub's public `/ws` endpoint.
    /// `ws_url` is the neighbor's own reachable signaling address. Spawns
    /// its own background task and returns immediately.
    pub fn dial(self: &Arc<Self>, ws_url: &str) {
        let url = format!(
            "{}?peerId={}",
            ws_url.trim_end_matches('/'),
            self.state.self_peer_id
        );
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match connect_async(&url).await {
                Ok((stream, _)) => {
                    info!(url = %url, "hub-mesh overlay link established");
                    this.run_link(stream).await;
                }
                Err(error) => {
                    warn!(url = %url, %error, "hub-mesh overlay dial failed");
                    this.state.events.emit(HubEvent::Error { reason: format!("overlay dial to {url} failed: {error}") });
                }
            }
        });
    }

    async fn run_link<S>(self: Arc<Self>, stream: S)
    where
        S: futures::Sink<WsMessage> + futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = stream.split();
        let announce = Frame::Announce(
            FramePayload::new()
                .with_network(self.state.config.hub_mesh_namespace.clone())
                .with_from(self.state.self_peer_id.to_string())
                .with_data(serde_json::json!({ "isHub": true }))
                .with_timestamp(HubState::now_ms()),
        );
        if sink.send(WsMessage::Text(encode_frame(&announce).into())).await.is_err() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let mut neighbor_id: Option<PeerId> = None;

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if sink.send(WsMessage::Text(encode_frame(&frame).into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            match decode_frame(&text, self.state.config.max_message_size) {
                                Ok(frame) => {
                                    if neighbor_id.is_none() {
                                        if let Some(from) = frame.payload().and_then(|p| p.from_peer_id.clone()) {
                                            if let Ok(id) = from.parse::<PeerId>() {
                                                self.neighbors.insert(id.to_string(), Neighbor { peer_id: id, sender: tx.clone() });
                                                self.recompute_readiness();
                                                self.state.events.emit(HubEvent::HubP2pConnected { peer_id: id.to_string() });
                                                neighbor_id = Some(id);
                                            }
                                        }
                                    }
                                    debug!(kind = frame.kind(), "hub-mesh overlay frame received");
                                    if let Some(id) = neighbor_id {
                                        self.router.route(Source::Overlay(id.to_string()), frame);
                                    }
                                }
                                Err(error) => warn!(%error, "malformed overlay frame"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(error)) => {
                            warn!(%error, "hub-mesh overlay link error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        if let Some(id) = neighbor_id {
            self.neighbors.remove(&id.to_string());
            self.recompute_readiness();
            self.state.events.emit(HubEvent::HubP2pDisconnected { peer_id: id.to_string() });
            if self.state.hubs.unregister(&id.to_string()).is_some() {
                self.state.events.emit(HubEvent::HubUnregistered { peer_id: id.to_string() });
            }
        }
    }

    /// Unicast to one overlay neighbor, or multicast to all of them.
    pub fn send_message(&self, frame: Frame, target_hub_peer_id: Option<&str>) {
        match target_hub_peer_id {
            Some(target) => {
                if let Some(neighbor) = self.neighbors.get(target) {
                    let _ = neighbor.sender.send(frame);
                }
            }
            None => {
                for entry in self.neighbors.iter() {
                    let _ = entry.value().sender.send(frame.clone());
                }
            }
        }
    }

    /// Re-issue `frame` to up to `max_targets` overlay neighbors closest to
    /// `target`, excluding the hub that forwarded it to us (I6).
    pub fn forward_excluding(&self, frame: Frame, target: &PeerId, exclude_hub: &str, max_targets: usize) {
        let candidates: Vec<PeerId> = self
            .neighbors
            .iter()
            .filter(|entry| entry.key() != exclude_hub)
            .map(|entry| entry.value().peer_id)
            .collect();
        for closest in PeerId::closest(target, &candidates, max_targets) {
            if let Some(neighbor) = self.neighbors.get(&closest.to_string()) {
                let _ = neighbor.sender.send(frame.clone());
            }
        }
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh_for(state: HubState) -> Arc<HubMeshClient> {
        let router = Arc::new(Router::new(state.clone()));
        HubMeshClient::new(state, router)
    }

    #[test]
    fn readiness_follows_min_peers_threshold() {
        let state = HubState::for_test();
        let mesh = mesh_for(state);
        assert!(!mesh.is_overlay_ready());
        let (tx, _rx) = mpsc::unbounded_channel();
        mesh.neighbors.insert(
            "a".repeat(40),
            Neighbor { peer_id: "a".repeat(40).parse().unwrap(), sender: tx },
        );
        mesh.recompute_readiness();
        // one neighbor, min_peers defaults to 2 in for_test config
        assert!(!mesh.is_overlay_ready());
    }

    #[test]
    fn readiness_true_once_min_peers_met() {
        let state = HubState::for_test();
        let mesh = mesh_for(state);
        for i in 0..2u8 {
            let (tx, _rx) = mpsc::unbounded_channel();
            let id = format!("{:02x}", i).repeat(20);
            mesh.neighbors.insert(id.clone(), Neighbor { peer_id: id.parse().unwrap(), sender: tx });
        }
        mesh.recompute_readiness();
        assert!(mesh.is_overlay_ready());
    }

    #[test]
    fn forward_excluding_skips_origin_hub() {
        let state = HubState::for_test();
        let mesh = mesh_for(state);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let id_a = "a".repeat(40);
        let id_b = "b".repeat(40);
        mesh.neighbors.insert(id_a.clone(), Neighbor { peer_id: id_a.parse().unwrap(), sender: tx_a });
        mesh.neighbors.insert(id_b.clone(), Neighbor { peer_id: id_b.parse().unwrap(), sender: tx_b });

        let target: PeerId = "c".repeat(40).parse().unwrap();
        let frame = Frame::Ping(FramePayload::new());
        mesh.forward_excluding(frame, &target, &id_a, 2);

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }
}
