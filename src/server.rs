//! HTTP + WebSocket listener lifecycle: `start`/`stop`, the accept loop, and
//! the small HTTP surface (`/health`, `/hubs`, CORS preflight, catch-all
//! banner) served from the same port as client connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bootstrap::BootstrapConnector;
use crate::connection_table::{AddResult, PeerSocket};
use crate::error::HubError;
use crate::events::HubEvent;
use crate::hub_mesh::HubMeshClient;
use crate::migration::MigrationController;
use crate::peer_id::PeerId;
use crate::protocol::{decode_frame, encode_frame, Frame};
use crate::router::{Router as FrameRouter, Source};
use crate::state::HubState;

const STARTUP_FEDERATION_SETTLE: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct AppState {
    hub: HubState,
    router: Arc<FrameRouter>,
    shutdown: broadcast::Sender<()>,
    started_at: Arc<std::sync::Mutex<Option<Instant>>>,
}

pub struct HubServer {
    hub: HubState,
    router: Arc<FrameRouter>,
    hub_mesh: std::sync::Mutex<Option<Arc<HubMeshClient>>>,
    shutdown: broadcast::Sender<()>,
    bound_port: Arc<AtomicU16>,
    running: Arc<AtomicBool>,
    started_at: Arc<std::sync::Mutex<Option<Instant>>>,
}

impl HubServer {
    pub fn new(hub: HubState) -> Arc<Self> {
        let router = Arc::new(FrameRouter::new(hub.clone()));
        let (shutdown, _rx) = broadcast::channel(1);
        Arc::new(Self {
            hub,
            router,
            hub_mesh: std::sync::Mutex::new(None),
            shutdown,
            bound_port: Arc::new(AtomicU16::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            started_at: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    /// Bind, retrying the next port on collision up to `max_port_retries`,
    /// and serve in a background task. Returns the address actually bound.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, HubError> {
        let mut port = self.hub.config.port;
        let listener = loop {
            let addr = format!("{}:{}", self.hub.config.host, port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => break listener,
                Err(error) if port < self.hub.config.port + self.hub.config.max_port_retries => {
                    warn!(addr, %error, "port unavailable, trying next");
                    port += 1;
                }
                Err(error) => {
                    return Err(HubError::transport(format!("failed to bind after retries: {error}")));
                }
            }
        };
        let bound_addr = listener.local_addr().map_err(|e| HubError::transport(e.to_string()))?;
        self.bound_port.store(bound_addr.port(), Ordering::Release);

        let app_state = AppState {
            hub: self.hub.clone(),
            router: Arc::clone(&self.router),
            shutdown: self.shutdown.clone(),
            started_at: Arc::clone(&self.started_at),
        };
        let cors = CorsLayer::new()
            .allow_origin(self.cors_origin())
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any);
        let app = axum::Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/hubs", get(hubs_handler))
            .fallback(banner_handler)
            .with_state(app_state)
            .layer(cors)
            .layer(TraceLayer::new_for_http());

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;
        });

        self.running.store(true, Ordering::Release);
        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.hub.events.emit(HubEvent::Started { port: bound_addr.port() });
        info!(port = bound_addr.port(), "hub listening");

        self.spawn_cleanup_timer();

        if self.hub.config.is_hub && self.hub.config.auto_connect {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(STARTUP_FEDERATION_SETTLE).await;
                this.start_federation();
            });
        }

        Ok(bound_addr)
    }

    fn cors_origin(&self) -> tower_http::cors::AllowOrigin {
        if self.hub.config.cors_origin == "*" {
            tower_http::cors::AllowOrigin::any()
        } else {
            self.hub
                .config
                .cors_origin
                .parse()
                .map(tower_http::cors::AllowOrigin::exact)
                .unwrap_or_else(|_| tower_http::cors::AllowOrigin::any())
        }
    }

    fn start_federation(self: &Arc<Self>) {
        let mesh = HubMeshClient::new(self.hub.clone(), Arc::clone(&self.router));
        self.router.attach_hub_mesh(Arc::clone(&mesh));
        *self.hub_mesh.lock().unwrap() = Some(Arc::clone(&mesh));

        let connector = Arc::new(BootstrapConnector::new(self.hub.clone(), Arc::clone(&self.router)));
        connector.start();

        let migration = Arc::new(MigrationController::new(self.hub.clone(), Arc::clone(&mesh)));
        migration.spawn();
    }

    fn spawn_cleanup_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = Duration::from_secs(self.hub.config.cleanup_interval_secs);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = this.hub.sweep();
                        for peer_id in reaped {
                            this.hub.events.emit(HubEvent::PeerDisconnected { peer_id });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Disconnects the overlay, closes bootstrap links, drains client
    /// sockets, and stops the listener.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        self.hub.bootstrap_links.clear();
        *self.hub_mesh.lock().unwrap() = None;
        for peer_id in self.hub.connections.peer_ids() {
            self.hub.connections.remove(&peer_id);
        }
        self.running.store(false, Ordering::Release);
        self.hub.events.emit(HubEvent::Stopped);
        info!("hub stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn get_stats(&self) -> serde_json::Value {
        json!({
            "isRunning": self.is_running(),
            "connections": self.hub.connections.len(),
            "networks": self.hub.networks.network_count(),
            "hubs": self.hub.hubs.len(),
            "uptimeSecs": self.started_at.lock().unwrap().map(|t| t.elapsed().as_secs()).unwrap_or(0),
        })
    }

    pub fn get_hub_stats(&self) -> serde_json::Value {
        json!({
            "isHub": self.hub.config.is_hub,
            "selfPeerId": self.hub.self_peer_id.to_string(),
            "hubMeshNamespace": self.hub.config.hub_mesh_namespace,
            "knownHubs": self.hub.hubs.len(),
            "overlayNeighbors": self.hub_mesh.lock().unwrap().as_ref().map(|m| m.neighbor_count()).unwrap_or(0),
            "bootstrapLinks": self.hub.bootstrap_links.len(),
        })
    }

    pub fn get_peers(&self) -> Vec<String> {
        self.hub.connections.peer_ids()
    }

    pub fn get_hub_mesh_namespace(&self) -> String {
        self.hub.config.hub_mesh_namespace.clone()
    }

    /// Rejected with `ConfigError` while the hub is running (the namespace
    /// is immutable once federation wiring has started).
    pub fn set_hub_mesh_namespace(&self, _name: String) -> Result<(), HubError> {
        if self.is_running() {
            return Err(HubError::config("cannot change hubMeshNamespace while running"));
        }
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let peer_id = query.get("peerId").cloned();
    ws.on_upgrade(move |socket| handle_connection(socket, state, peer_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, peer_id: Option<String>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(peer_id) = peer_id else {
        let _ = ws_sender
            .send(close_message(1008, "Missing peerId query parameter"))
            .await;
        return;
    };
    if peer_id.parse::<PeerId>().is_err() {
        let _ = ws_sender.send(close_message(1008, "Invalid peerId")).await;
        return;
    }
    if state.hub.connections.len() >= state.hub.config.max_connections {
        let _ = ws_sender.send(close_message(1008, "Maximum connections reached")).await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let is_hub_link = false;
    let socket_handle = PeerSocket::new(tx, is_hub_link);

    match state.router.admit(&peer_id, socket_handle) {
        AddResult::Rejected => {
            let _ = ws_sender.send(close_message(1008, "Peer already connected")).await;
            return;
        }
        AddResult::Added | AddResult::DuplicateDisplacingStale => {}
    }

    let mut shutdown_rx = state.shutdown.subscribe();
    let sender_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_sender.send(Message::Text(encode_frame(&frame).into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = ws_sender.send(close_message(1000, "Server shutting down")).await;
                    break;
                }
            }
        }
    });

    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                state.hub.connections.touch(&peer_id);
                match decode_frame(&text, state.hub.config.max_message_size) {
                    Ok(frame) => state.router.route(Source::Client(peer_id.clone()), frame),
                    Err(error) => warn!(peer_id, %error, "dropping malformed frame"),
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(error)) => {
                warn!(peer_id, %error, "websocket error");
                break;
            }
            _ => {}
        }
    }

    let was_hub = state.hub.connections.is_hub(&peer_id);
    state.hub.connections.remove(&peer_id);
    state.hub.events.emit(HubEvent::PeerDisconnected { peer_id: peer_id.clone() });
    if was_hub && state.hub.hubs.unregister(&peer_id).is_some() {
        state.hub.events.emit(HubEvent::HubUnregistered { peer_id: peer_id.clone() });
    }
    sender_task.abort();
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = state.started_at.lock().unwrap().map(|t| t.elapsed().as_secs()).unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "timestamp": HubState::now_ms(),
        "uptime": uptime_secs,
        "isHub": state.hub.config.is_hub,
        "connections": state.hub.connections.len(),
        "peers": state.hub.connections.len(),
        "hubs": state.hub.hubs.len(),
        "networks": state.hub.networks.network_count(),
        "memory": memory_usage_bytes(),
    }))
}

/// Best-effort resident set size in bytes, read from `/proc/self/statm` on
/// Linux. Not available on other platforms; reports `null` there.
fn memory_usage_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

async fn hubs_handler(State(state): State<AppState>) -> impl IntoResponse {
    let hubs: Vec<serde_json::Value> = state
        .hub
        .hubs
        .all()
        .into_iter()
        .map(|record| json!({ "peerId": record.peer_id, "networkName": record.network_name }))
        .collect();
    Json(json!({
        "timestamp": HubState::now_ms(),
        "totalHubs": hubs.len(),
        "hubs": hubs,
    }))
}

async fn banner_handler() -> impl IntoResponse {
    "pigeon-hub: federated WebRTC signaling hub\n"
}
