//! Hub configuration.
//!
//! CLI flags with environment-variable fallbacks, the way the signaling
//! stack's CLI launchers are built — parsed once at startup into an
//! immutable `HubConfig`.

use clap::Parser;

/// Reserved network name hubs use to discover and mesh with each other.
pub const DEFAULT_HUB_MESH_NAMESPACE: &str = "pigeonhub-mesh";

/// Default network name a client is placed into when it doesn't declare one.
pub const DEFAULT_NETWORK_NAME: &str = "global";

#[derive(Parser, Debug, Clone)]
#[command(name = "pigeon-hub", version, about = "Federated WebRTC signaling hub")]
pub struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 3000, env = "HUB_PORT")]
    pub port: u16,

    /// Host/interface to bind.
    #[arg(long, default_value = "0.0.0.0", env = "HUB_HOST")]
    pub host: String,

    /// How many sequential ports to try if the requested one is in use.
    #[arg(long, default_value_t = 10, env = "HUB_MAX_PORT_RETRIES")]
    pub max_port_retries: u16,

    /// Hard cap on simultaneously connected client sockets.
    #[arg(long, default_value_t = 10_000, env = "HUB_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Liveness sweep cadence, in seconds.
    #[arg(long, default_value_t = 30, env = "HUB_CLEANUP_INTERVAL_SECS")]
    pub cleanup_interval_secs: u64,

    /// Idle threshold before a peer is closed by the sweep, in seconds.
    #[arg(long, default_value_t = 300, env = "HUB_PEER_TIMEOUT_SECS")]
    pub peer_timeout_secs: u64,

    /// Maximum frame payload size, in bytes.
    #[arg(long, default_value_t = 1_048_576, env = "HUB_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,

    /// Whether this instance participates in federation (hub-mesh + bootstrap).
    #[arg(long, default_value_t = false, env = "HUB_IS_HUB")]
    pub is_hub: bool,

    /// Reserved network name used for hub-mesh discovery.
    #[arg(long, default_value = DEFAULT_HUB_MESH_NAMESPACE, env = "HUB_MESH_NAMESPACE")]
    pub hub_mesh_namespace: String,

    /// Bootstrap hub WebSocket URIs to dial (comma-separated).
    #[arg(long, env = "HUB_BOOTSTRAP_HUBS", value_delimiter = ',')]
    pub bootstrap_hubs: Vec<String>,

    /// If false, federation wiring (hub-mesh + bootstrap) is deferred until
    /// an explicit call rather than started automatically on `start()`.
    #[arg(long, default_value_t = true, env = "HUB_AUTO_CONNECT")]
    pub auto_connect: bool,

    /// Fixed interval between bootstrap reconnect attempts, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "HUB_RECONNECT_INTERVAL_MS")]
    pub reconnect_interval_ms: u64,

    /// Bootstrap reconnect attempts before a link is abandoned.
    #[arg(long, default_value_t = 10, env = "HUB_MAX_RECONNECT_ATTEMPTS")]
    pub max_reconnect_attempts: u32,

    /// Minimum desired hub-mesh overlay neighbors.
    #[arg(long, default_value_t = 2, env = "HUB_MESH_MIN_PEERS")]
    pub hub_mesh_min_peers: usize,

    /// Maximum hub-mesh overlay neighbors before eviction kicks in.
    #[arg(long, default_value_t = 3, env = "HUB_MESH_MAX_PEERS")]
    pub hub_mesh_max_peers: usize,

    /// Debounce between overlay readiness and migration, in milliseconds.
    #[arg(long, default_value_t = 0, env = "HUB_MESH_MIGRATION_DELAY_MS")]
    pub mesh_migration_delay_ms: u64,

    /// Raise the default log filter to `debug` for this crate.
    #[arg(long, default_value_t = false, env = "HUB_VERBOSE")]
    pub verbose_logging: bool,

    /// CORS origin honored on the HTTP surface and WebSocket preflight.
    #[arg(long, default_value = "*", env = "CORS_ORIGIN")]
    pub cors_origin: String,
}

/// Validated, immutable hub configuration.
///
/// Built once from [`Args`]; the only supported runtime mutation is
/// `setHubMeshNamespace`, which is rejected with [`crate::error::HubError::Config`]
/// whenever the hub is already running.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub port: u16,
    pub host: String,
    pub max_port_retries: u16,
    pub max_connections: usize,
    pub cleanup_interval_secs: u64,
    pub peer_timeout_secs: u64,
    pub max_message_size: usize,
    pub is_hub: bool,
    pub hub_mesh_namespace: String,
    pub bootstrap_hubs: Vec<String>,
    pub auto_connect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub hub_mesh_min_peers: usize,
    pub hub_mesh_max_peers: usize,
    pub mesh_migration_delay_ms: u64,
    pub verbose_logging: bool,
    pub cors_origin: String,
}

impl HubConfig {
    /// Validate and freeze a parsed [`Args`] into a `HubConfig`.
    pub fn from_args(args: Args) -> Result<Self, String> {
        if args.hub_mesh_min_peers > args.hub_mesh_max_peers {
            return Err(format!(
                "hub_mesh_min_peers ({}) must not exceed hub_mesh_max_peers ({})",
                args.hub_mesh_min_peers, args.hub_mesh_max_peers
            ));
        }
        if args.hub_mesh_max_peers == 0 {
            return Err("hub_mesh_max_peers must be at least 1".to_string());
        }

        Ok(Self {
            port: args.port,
            host: args.host,
            max_port_retries: args.max_port_retries,
            max_connections: args.max_connections,
            cleanup_interval_secs: args.cleanup_interval_secs,
            peer_timeout_secs: args.peer_timeout_secs,
            max_message_size: args.max_message_size,
            is_hub: args.is_hub,
            hub_mesh_namespace: args.hub_mesh_namespace,
            bootstrap_hubs: args
                .bootstrap_hubs
                .into_iter()
                .filter(|u| !u.trim().is_empty())
                .collect(),
            auto_connect: args.auto_connect,
            reconnect_interval_ms: args.reconnect_interval_ms,
            max_reconnect_attempts: args.max_reconnect_attempts,
            hub_mesh_min_peers: args.hub_mesh_min_peers,
            hub_mesh_max_peers: args.hub_mesh_max_peers,
            mesh_migration_delay_ms: args.mesh_migration_delay_ms,
            verbose_logging: args.verbose_logging,
            cors_origin: args.cors_origin,
        })
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            port: 0,
            host: "127.0.0.1".to_string(),
            max_port_retries: 1,
            max_connections: 100,
            cleanup_interval_secs: 30,
            peer_timeout_secs: 300,
            max_message_size: 1_048_576,
            is_hub: false,
            hub_mesh_namespace: DEFAULT_HUB_MESH_NAMESPACE.to_string(),
            bootstrap_hubs: Vec::new(),
            auto_connect: true,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            hub_mesh_min_peers: 2,
            hub_mesh_max_peers: 3,
            mesh_migration_delay_ms: 0,
            verbose_logging: false,
            cors_origin: "*".to_string(),
        }
    }
}
