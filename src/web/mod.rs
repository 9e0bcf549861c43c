//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::devices::DeviceService;
use crate::discovery::Discovery;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub service: Arc<DeviceService>,
    pub scheduler: Arc<Scheduler>,
    pub discovery: Arc<Discovery>,
}

/// Web server for the fleet API.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        service: Arc<DeviceService>,
        scheduler: Arc<Scheduler>,
        discovery: Arc<Discovery>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                service,
                scheduler,
                discovery,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/devices", get(handlers::handle_get_devices))
            .route(
                "/api/devices/{id}",
                get(handlers::handle_get_device).delete(handlers::handle_delete_device),
            )
            .route("/api/devices/{id}/status", put(handlers::handle_set_status))
            .route(
                "/api/devices/{id}/frequency",
                put(handlers::handle_set_frequency),
            )
            .route(
                "/api/devices/{id}/settings",
                put(handlers::handle_update_settings),
            )
            .route(
                "/api/discovery",
                get(handlers::handle_get_discovery).post(handlers::handle_start_discovery),
            )
            .route("/api/jobs", get(handlers::handle_get_jobs))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
