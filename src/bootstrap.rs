//! Outbound federation links: this hub dialing other hubs' framed listener
//! directly (as opposed to the hub-mesh overlay, which dials the *client*
//! endpoint). Reconnects on a fixed interval, bounded by a maximum attempt
//! count, and skips a URI that resolves to this hub's own listening address.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

use crate::events::HubEvent;
use crate::protocol::{decode_frame, encode_frame, Frame, FramePayload};
use crate::router::{Router, Source};
use crate::state::HubState;

pub struct BootstrapConnector {
    state: HubState,
    router: Arc<Router>,
}

impl BootstrapConnector {
    pub fn new(state: HubState, router: Arc<Router>) -> Self {
        Self { state, router }
    }

    /// Spawn one persistent connection task per configured bootstrap URI.
    pub fn start(self: Arc<Self>) {
        for uri in self.state.config.bootstrap_hubs.clone() {
            if self.is_self(&uri) {
                info!(uri, "skipping self-targeted bootstrap URI");
                continue;
            }
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.connection_loop(uri).await });
        }
    }

    fn is_self(&self, uri: &str) -> bool {
        let self_addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        uri.contains(&self_addr)
    }

    async fn connection_loop(self: Arc<Self>, uri: String) {
        let mut attempts: u32 = 0;
        let interval = Duration::from_millis(self.state.config.reconnect_interval_ms);

        loop {
            match self.connect_once(&uri).await {
                Ok(()) => {
                    info!(uri, "bootstrap link closed cleanly");
                    attempts = 0;
                }
                Err(error) => {
                    warn!(uri, %error, "bootstrap link failed");
                    self.state.events.emit(HubEvent::Error { reason: format!("bootstrap link to {uri} failed: {error}") });
                }
            }

            self.state.bootstrap_links.remove(&uri);
            self.state.events.emit(HubEvent::BootstrapDisconnected { uri: uri.clone() });

            attempts += 1;
            if attempts >= self.state.config.max_reconnect_attempts {
                warn!(uri, attempts, "giving up on bootstrap link after max reconnect attempts");
                return;
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn connect_once(&self, uri: &str) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let url = format!("{}?peerId={}", uri.trim_end_matches('/'), self.state.self_peer_id);
        let (stream, _response) = connect_async(&url).await?;
        let (mut sink, mut stream) = stream.split();

        self.state.events.emit(HubEvent::BootstrapConnected { uri: uri.to_string() });

        let announce = Frame::Announce(
            FramePayload::new()
                .with_network(self.state.config.hub_mesh_namespace.clone())
                .with_from(self.state.self_peer_id.to_string())
                .with_data(serde_json::json!({ "isHub": true }))
                .with_timestamp(HubState::now_ms()),
        );
        sink.send(WsMessage::Text(encode_frame(&announce).into())).await?;

        // Flood currently announced local (non-hub) peers for catch-up.
        for network in self.local_networks() {
            for peer_id in self.state.networks.members(&network) {
                if self.state.hubs.contains(&peer_id) {
                    continue;
                }
                let flood = Frame::PeerDiscovered(
                    FramePayload::new()
                        .with_network(network.clone())
                        .with_from(peer_id)
                        .with_timestamp(HubState::now_ms()),
                );
                sink.send(WsMessage::Text(encode_frame(&flood).into())).await?;
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        self.state.bootstrap_links.insert(uri.to_string(), tx);

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
                                Ok(frame) => self.router.route(Source::Bootstrap(uri.to_string()), frame),
                                Err(error) => warn!(uri, %error, "malformed bootstrap frame"),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(error)) => {
                            warn!(uri, %error, "bootstrap link error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(())
    }

    fn local_networks(&self) -> Vec<String> {
        self.state
            .connections
            .peer_ids()
            .into_iter()
            .filter_map(|id| self.state.connections.network_of(&id))
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_self_matches_configured_host_and_port() {
        let mut state = HubState::for_test();
        Arc::get_mut(&mut state.config).unwrap().host = "127.0.0.1".to_string();
        Arc::get_mut(&mut state.config).unwrap().port = 3000;
        let router = Arc::new(Router::new(state.clone()));
        let connector = BootstrapConnector::new(state, router);
        assert!(connector.is_self("ws://127.0.0.1:3000/ws"));
        assert!(!connector.is_self("ws://127.0.0.1:3001/ws"));
    }
}
