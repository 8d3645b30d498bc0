//! Web server module.

mod handlers;
mod socket;

pub use handlers::*;
pub use socket::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::hub::Hub;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub hub: Arc<Hub>,
    pub scheduler: Arc<Scheduler>,
}

/// HTTP API and validator socket.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        hub: Arc<Hub>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                hub,
                scheduler,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Validators
            .route("/ws", get(socket::handle_ws))
            // API endpoints
            .route(
                "/api/v1/website",
                post(handlers::handle_create_website).delete(handlers::handle_delete_website),
            )
            .route("/api/v1/website/status", get(handlers::handle_website_status))
            .route("/api/v1/website/recheck", post(handlers::handle_recheck))
            .route("/api/v1/websites", get(handlers::handle_list_websites))
            .route("/api/v1/validators", get(handlers::handle_list_validators))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until Ctrl-C.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Web server shutting down");
        })
        .await?;

        Ok(())
    }
}
