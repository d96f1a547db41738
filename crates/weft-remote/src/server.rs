use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use weft_engine::Dispatcher;

use crate::routes;
use crate::state::PeerState;

/// HTTP server that runs this process's local handlers for remote callers.
pub struct PeerServer {
    bind: String,
    state: Arc<PeerState>,
}

impl PeerServer {
    pub fn new(bind: impl Into<String>, dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_state(bind, PeerState::new(dispatcher, false))
    }

    pub fn with_state(bind: impl Into<String>, state: PeerState) -> Self {
        Self {
            bind: bind.into(),
            state: Arc::new(state),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/node-types", get(routes::node_types))
            .route("/api/executions", post(routes::execute))
            .route("/api/executions/{id}", delete(routes::cancel))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve until `shutdown` is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind).await?;
        info!(bind = %self.bind, "Peer server listening");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        info!("Peer server shut down");
        Ok(())
    }
}
