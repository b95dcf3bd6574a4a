use log::{error, info};
use scribe_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting scribe-server v{}", env!("CARGO_PKG_VERSION"));
    match &config.storage_path {
        Some(path) => info!("Storage path: {}", path.display()),
        None => info!("Storage: in-memory"),
    }
    if let Some(period) = config.room.checkpoint_interval {
        info!("Checkpointing active rooms every {}s", period.as_secs());
    }

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
    info!("Server shut down gracefully");
}
