//! Status API server implementation using axum

use anyhow::{Context, Result};
use axum::http::{HeaderName, Method};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

use fleetguard_core::api::FleetGuard;
use fleetguard_core::config::WebSettings;

use super::api::{self, ApiState};

/// Build the full application router
pub fn router(guard: Arc<FleetGuard>) -> Router {
    let api_state = Arc::new(ApiState { guard });

    // Read-only apart from /api/evaluate, which has no side effects
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([HeaderName::from_static("content-type")]);

    let api_routes = Router::new()
        .route("/circuits", get(api::get_circuits))
        .route("/circuits/{tenant}", get(api::get_tenant_circuit))
        .route("/usage", get(api::get_usage))
        .route("/evaluate", post(api::evaluate))
        .with_state(api_state.clone());

    Router::new()
        .route("/health", get(api::health))
        .with_state(api_state)
        .nest("/api", api_routes)
        .layer(cors)
}

/// Status API server
pub struct WebServer {
    settings: WebSettings,
    guard: Arc<FleetGuard>,
}

impl WebServer {
    /// Create a new web server
    pub fn new(settings: WebSettings, guard: Arc<FleetGuard>) -> Self {
        Self { settings, guard }
    }

    /// Start the web server in a background task; it stops once `stop` fires
    pub fn start(self, stop: oneshot::Receiver<()>) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(stop).await })
    }

    /// Run the web server
    async fn run(self, stop: oneshot::Receiver<()>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.settings.bind, self.settings.port)
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.settings.bind))?;

        let app = router(self.guard);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status API on {}", addr))?;
        tracing::info!("Status API listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.await;
            })
            .await?;

        tracing::info!("Status API stopped");
        Ok(())
    }
}
