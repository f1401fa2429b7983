use std::sync::Arc;

use flowci_engine::{CallbackRouter, JobOrchestrator};

/// Shared application state for axum handlers.
pub struct AppState {
    pub orchestrator: Arc<JobOrchestrator>,
    pub callbacks: CallbackRouter,
}
