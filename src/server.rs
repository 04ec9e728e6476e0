use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use log::info;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::ServiceBuilder;

use crate::api::{self, AppState};
use crate::error::RelayError;

pub struct WebServer {
    host: String,
    port: u16,
}

impl WebServer {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    pub async fn start(&self, state: AppState) -> Result<(), RelayError> {
        let app = self.create_router(state);

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| RelayError::Error(format!("Invalid address: {}", e)))?;

        info!("Relay listening on http://{addr}");

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| RelayError::Error(format!("Server error: {}", e)))?;

        Ok(())
    }

    fn create_router(&self, state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/api/v1/search/saves", post(api::search_saves))
            .route("/api/v1/search/bundles", post(api::search_bundles))
            .route("/api/v1/upload/save", post(api::upload_save))
            .route("/api/v1/upload/bundle", post(api::upload_bundle))
            .route("/api/v1/download/{kind}/{code}", get(api::download))
            .layer(ServiceBuilder::new().layer(axum::Extension(state)))
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
