//! Web server module.

mod handlers;

pub use handlers::*;

use axum::{routing::get, Router};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub telemetry_path: String,
}

/// Metrics HTTP server.
pub struct Server {
    state: AppState,
    listen_address: String,
}

impl Server {
    /// Create a new server exposing `registry` at `telemetry_path`.
    pub fn new(registry: Registry, listen_address: String, telemetry_path: String) -> Self {
        Self {
            state: AppState {
                registry,
                telemetry_path,
            },
            listen_address,
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let mut router = Router::new().route(
            self.state.telemetry_path.as_str(),
            get(handlers::handle_metrics),
        );
        if self.state.telemetry_path != "/" {
            router = router.route("/", get(handlers::handle_index));
        }
        router
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` fires.
    pub async fn start(
        &self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = self.routes();

        let listener = tokio::net::TcpListener::bind(self.listen_address.as_str()).await?;
        tracing::info!(
            "Metrics server listening on {} (path {})",
            listener.local_addr()?,
            self.state.telemetry_path
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}
