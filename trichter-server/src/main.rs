use std::process::ExitCode;

use trichter_server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if config.ingest.is_none() {
        log::warn!("No ingest credential configured; device uploads will be refused");
    }
    log::info!(
        "Starting trichter-server ({} viewer sessions, WebSocket {})",
        config.sessions.len(),
        config.ws_addr.as_deref().unwrap_or("disabled"),
    );

    match Server::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
