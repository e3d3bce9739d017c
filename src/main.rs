//! Process entry point: parse configuration, initialize logging, start the
//! hub, and wait for a shutdown signal.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pigeon_hub::config::{Args, HubConfig};
use pigeon_hub::server::HubServer;
use pigeon_hub::state::HubState;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let verbose = args.verbose_logging;
    init_tracing(verbose);

    let config = match HubConfig::from_args(args) {
        Ok(config) => config,
        Err(reason) => {
            eprintln!("invalid configuration: {reason}");
            std::process::exit(1);
        }
    };

    let state = HubState::new(config);
    let server = HubServer::new(state);

    let addr = match server.start().await {
        Ok(addr) => addr,
        Err(error) => {
            tracing::error!(%error, "failed to start hub");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "hub listening");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");
    server.stop().await;
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "pigeon_hub=debug,warn" } else { "pigeon_hub=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
