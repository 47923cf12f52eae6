#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use mark46_server::config::{Args, ServerConfig};
use mark46_server::metrics::{self, ReadyFlag};
use mark46_server::{run, ServerState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }
    if config.tls {
        warn!("TLS termination is handled by the fronting listener; serving plain TCP here");
    }

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("bound to {}:{}", config.host, config.port);

    let ready = ReadyFlag::ready();

    tokio::spawn({
        let ready = ready.clone();
        let metrics_addr = config.metrics_addr;
        async move {
            if let Err(e) = metrics::serve(metrics_addr, ready).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::select! {
        result = run(listener, state.clone()) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            state.set_running(false);
            ready.set(false);
        }
    }

    Ok(())
}
