//! Standalone signaling server: bootstraps peer-mesh discovery.
//!
//! Usage: `conflux-signal [bind-addr]` (default `127.0.0.1:9091`).

use log::info;

use conflux_sync::signal::SignalingServer;

const DEFAULT_BIND: &str = "127.0.0.1:9091";

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let bind_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_BIND.to_string());

    info!("Starting conflux signaling...");
    let server = SignalingServer::new(bind_addr);
    let addr = server.serve().await?;
    info!("Signaling ready on {addr}");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
