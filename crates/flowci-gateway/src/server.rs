use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use flowci_core::config::GatewayConfig;
use flowci_dispatch::webhook::HOOK_PATH;
use flowci_engine::{CallbackRouter, JobOrchestrator};

use crate::routes;
use crate::state::AppState;

/// HTTP gateway built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    orchestrator: Arc<JobOrchestrator>,
    callbacks: CallbackRouter,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        orchestrator: Arc<JobOrchestrator>,
        callbacks: CallbackRouter,
    ) -> Self {
        Self {
            config,
            orchestrator,
            callbacks,
        }
    }

    /// The full route table, without binding a listener.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            orchestrator: self.orchestrator.clone(),
            callbacks: self.callbacks.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            // Jobs
            .route("/jobs", post(routes::create_job).get(routes::list_jobs))
            .route("/jobs/{key}", get(routes::get_job))
            .route("/jobs/{key}/nodes", get(routes::job_nodes))
            .route("/jobs/{key}/{number}", get(routes::get_job_by_number))
            // Agent callbacks
            .route(HOOK_PATH, post(routes::cmd_callback))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
