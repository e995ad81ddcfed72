//! Palaver feed server.
//!
//! Configured from the environment (`PALAVER_BIND`, `PALAVER_DATA_DIR`,
//! `PALAVER_BROADCAST_CAPACITY`); log level via `RUST_LOG`.

use log::{error, info};
use palaver_sync::{FeedServer, ServerConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    match &config.data_dir {
        Some(path) => info!("Message store at {}", path.display()),
        None => info!("No data dir configured; messages are kept in memory only"),
    }

    let server = Arc::new(FeedServer::new(config)?);
    let runner = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut serve => {
            // Listener failed before any shutdown request.
            return match result? {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!("Feed server stopped: {e}");
                    Err(e)
                }
            };
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupt received, shutting down");
        }
    }

    server.shutdown();
    serve.await??;

    let stats = server.stats().await;
    info!(
        "Served {} connections, {} writes accepted, {} rejected",
        stats.total_connections, stats.writes_accepted, stats.writes_rejected
    );
    Ok(())
}
