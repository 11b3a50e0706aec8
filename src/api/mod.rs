//! HTTP API server for the fleet gateway

pub mod admin;
mod auth;
pub mod gate;
pub mod health;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::control::ControlPlane;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub control: Arc<ControlPlane>,
    /// Bearer key required on admin endpoints, when set
    pub api_key: Option<String>,
}

/// Build the router with all routes
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api/admin", admin::router(Arc::clone(&state)))
        .merge(health::router())
        .merge(health::gated_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub fn new(control: Arc<ControlPlane>, api_key: Option<String>, port: u16) -> Self {
        Self {
            state: Arc::new(ApiState { control, api_key }),
            port,
        }
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.state.api_key.is_none() {
            tracing::warn!("FLEET_API_KEY not set - admin endpoints are unauthenticated");
        }

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(
            listener,
            router(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
