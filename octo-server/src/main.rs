use log::{error, info};
use octo_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "octo-server starting: bind {}, storage {}",
        config.bind_addr,
        config.storage_path.display()
    );

    let server = match SyncServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("could not open document store: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server stopped: {e}");
        std::process::exit(1);
    }
}
