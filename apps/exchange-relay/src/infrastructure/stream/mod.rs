//! Stream Server
//!
//! Client-facing HTTP server: the WebSocket endpoint and read-only JSON
//! query routes. Handlers only translate between HTTP and the core; the
//! push logic lives in the broadcast hub.
//!
//! # Endpoints
//!
//! - `GET /ws` - WebSocket stream
//! - `GET /api/stocks` - full history of every instrument
//! - `GET /api/stocks/{id}` - full history of one instrument
//! - `GET /api/summary` - summary of instruments with samples
//! - `GET /api/metadata` - instrument directory
//! - `GET /api/metadata/{id}` - metadata of one instrument
//! - `GET /api/ids` - every listed instrument ID

mod api;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::QueryService;
use crate::infrastructure::broadcast::SharedBroadcastHub;

// =============================================================================
// State
// =============================================================================

/// Shared state for stream handlers.
#[derive(Debug)]
pub struct StreamState {
    hub: SharedBroadcastHub,
    query: QueryService,
    shutdown: CancellationToken,
}

impl StreamState {
    /// Create handler state. Open sockets close when `shutdown` fires.
    #[must_use]
    pub const fn new(
        hub: SharedBroadcastHub,
        query: QueryService,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            query,
            shutdown,
        }
    }
}

/// Build the stream router.
pub fn router(state: Arc<StreamState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/stocks", get(api::all_stocks))
        .route("/api/stocks/{id}", get(api::stock))
        .route("/api/summary", get(api::summary))
        .route("/api/metadata", get(api::all_metadata))
        .route("/api/metadata/{id}", get(api::metadata))
        .route("/api/ids", get(api::stock_ids))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// WebSocket and query HTTP server.
pub struct StreamServer {
    port: u16,
    state: Arc<StreamState>,
    cancel: CancellationToken,
}

impl StreamServer {
    /// Create a new stream server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<StreamState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::ServerFailed` if the HTTP server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let port = listener.local_addr().map_or(self.port, |a| a.port());
        tracing::info!(port, "Stream server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Stream server stopped");
        Ok(())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}
