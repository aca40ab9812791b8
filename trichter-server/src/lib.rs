//! # trichter-server — Leaderboard process
//!
//! Wires the sync layer to the outside world: run mutations and the
//! ranked snapshot over HTTP, live updates over SSE and (optionally)
//! WebSocket.
//!
//! ```text
//!   HTTP :3000 ──► http::router ──► RunService ──► RunBus ──► StreamEndpoint
//!                       │                                          │
//!                       └── /api/v1/runs/sse ◄─────────────────────┤
//!   WS   :3001 ──► WsFanout ◄──────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`] — Environment configuration
//! - [`http`] — Routes, caller resolution, JSON errors

pub mod config;
pub mod http;

use std::future::Future;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use trichter_live::{MemoryRunRepository, RunBus, RunService, StreamEndpoint, WsFanout};

// Re-exports for convenience
pub use config::{ConfigError, ServerConfig};
pub use http::{router, ApiError, AppState};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("server error: {0}")]
    Io(#[from] io::Error),
}

/// The assembled process: storage, bus, stream endpoint and routes.
pub struct Server {
    config: ServerConfig,
    state: AppState,
    repository: MemoryRunRepository,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let repository = MemoryRunRepository::new();
        // Signed-in viewers are the users runs can be assigned to.
        for viewer in config.sessions.viewers() {
            repository.register_user(viewer.as_owner());
        }

        let bus = RunBus::new(config.bus.clone());
        let endpoint = StreamEndpoint::new(bus.clone(), config.stream.clone());
        let service = RunService::new(Arc::new(repository.clone()), bus);
        let state = AppState {
            service,
            endpoint,
            sessions: Arc::new(config.sessions.clone()),
            ingest: config.ingest.clone(),
        };

        Self {
            config,
            state,
            repository,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn repository(&self) -> &MemoryRunRepository {
        &self.repository
    }

    /// Bind the configured addresses and serve until ctrl-c.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.config.http_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        log::info!("HTTP listening on {addr}");

        if let Some(ws_addr) = self.config.ws_addr.clone() {
            let fanout = WsFanout::new(self.state.endpoint.clone(), ws_addr);
            tokio::spawn(async move {
                if let Err(e) = fanout.run().await {
                    log::error!("WebSocket fan-out stopped: {e}");
                }
            });
        }

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve HTTP on `listener` until `shutdown` resolves.
    ///
    /// Open streams are closed when shutdown begins so that in-flight
    /// requests can drain.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let endpoint = self.state.endpoint.clone();
        let app = router(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                log::info!("Shutting down");
                endpoint.shutdown();
            })
            .await?;
        log::info!("Server stopped");
        Ok(())
    }
}
