//! Vigil server: the engine loops plus the HTTP API.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::EngineBuilder;
use crate::error::{ServerError, ServerResult};
use crate::routes::create_router;
use crate::state::AppState;

/// One Vigil replica.
#[derive(Debug, Clone)]
pub struct VigilServer {
    state: Arc<AppState>,
}

impl VigilServer {
    /// Create a server from configuration with in-process stores.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a stored
    /// Alertmanager configuration cannot be loaded.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Ok(Self::from_state(EngineBuilder::new(config).build()?))
    }

    /// Create a server around an already wired state.
    #[must_use]
    pub fn from_state(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Get the shared state.
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router without starting anything.
    pub fn router(&self) -> axum::Router {
        create_router(Arc::clone(&self.state))
    }

    /// Start the engine and serve the API until `shutdown` completes.
    ///
    /// After the listener closes, the engine loops are told to stop and
    /// in-flight evaluations are drained before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the server stops abnormally.
    pub async fn serve_with_shutdown<F>(&self, addr: SocketAddr, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = self.state.start(stop_rx);

        info!(addr = %addr, peer = %self.state.config().ha.peer_name, "Vigil server listening");

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(ServerError::Serve);

        let _ = stop_tx.send(true);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        info!("Vigil server shut down");
        served
    }
}
