//! Inkboard collaboration server.
//!
//! Configured from the environment (`JWT_SECRET` is required); log
//! filtering via `RUST_LOG`.

use log::{error, info};
use std::time::Duration;

use inkboard_collab::{CollabServer, ServerConfig};

/// Upper bound on draining pending writes at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!("Starting Inkboard collab server on {}...", config.bind_addr);

    let mut server = match CollabServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    if server.shutdown(DRAIN_TIMEOUT).await {
        info!("All pending writes persisted");
    }
}
