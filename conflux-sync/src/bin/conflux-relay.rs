//! Standalone relay: fans collaboration envelopes out to project rooms.
//!
//! Usage: `conflux-relay [bind-addr]` (default `127.0.0.1:9090`).

use log::info;

use conflux_sync::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }

    info!("Starting conflux relay...");
    let server = RelayServer::new(config);
    let addr = server.serve().await?;
    info!("Relay ready on {addr}");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down: {:?}", server.stats().await);
    Ok(())
}
