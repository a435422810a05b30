pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::pipeline::handlers as pipeline;
use crate::state::AppState;
use crate::storage::handlers as storage;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Generation
        .route("/api/v1/analyze", post(pipeline::handle_analyze))
        .route("/api/v1/optimize", post(pipeline::handle_optimize))
        .route("/api/v1/refine", post(pipeline::handle_refine))
        .route("/api/v1/jobs/:id", get(pipeline::handle_get_job))
        // Workflows
        .route("/api/v1/workflows", get(pipeline::handle_list_workflows))
        .route("/api/v1/workflows/:id", get(pipeline::handle_get_workflow))
        .route(
            "/api/v1/workflows/:id/analyze",
            post(pipeline::handle_analyze_version),
        )
        .route(
            "/api/v1/workflows/:id/compile",
            post(pipeline::handle_compile),
        )
        .route(
            "/api/v1/workflows/:id/versions",
            get(storage::handle_list_versions),
        )
        .route(
            "/api/v1/workflows/:id/:version/:filename",
            get(storage::handle_get_file),
        )
        // Workspace
        .route("/api/v1/templates", get(storage::handle_list_templates))
        .route("/api/v1/profiles", get(storage::handle_list_profiles))
        .route(
            "/api/v1/config",
            get(storage::handle_get_config).put(storage::handle_update_config),
        )
        .with_state(state)
}
