use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workspace::WorkspaceConfig;
use super::InputCategory;
use crate::errors::AppError;
use crate::models::workflow::VersionLabel;
use crate::pipeline::handlers::{owned_workflow, UserIdQuery};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WorkspaceQuery {
    pub workspace_id: String,
}

#[derive(Serialize)]
pub struct VersionListResponse {
    pub workflow_id: Uuid,
    pub versions: Vec<VersionLabel>,
}

/// GET /api/v1/workflows/:id/versions
///
/// Lists what is on disk, which includes versions from manual compiles and
/// renders whose job has not been recorded yet.
pub async fn handle_list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(caller): Query<UserIdQuery>,
) -> Result<Json<VersionListResponse>, AppError> {
    let workflow = owned_workflow(&state, id, caller.user_id).await?;
    let versions = state
        .orchestrator
        .store()
        .list_versions(&workflow.workspace_id, workflow.id)
        .await?;
    Ok(Json(VersionListResponse {
        workflow_id: workflow.id,
        versions,
    }))
}

/// GET /api/v1/workflows/:id/:version/:filename
pub async fn handle_get_file(
    State(state): State<AppState>,
    Path((id, version, filename)): Path<(Uuid, String, String)>,
    Query(caller): Query<UserIdQuery>,
) -> Result<Response, AppError> {
    let workflow = owned_workflow(&state, id, caller.user_id).await?;
    let bytes = state
        .orchestrator
        .store()
        .read_labelled(&workflow.workspace_id, workflow.id, &version, &filename)
        .await?;

    let mime = mime_guess::from_path(&filename).first_or_octet_stream();
    let disposition = if mime == mime_guess::mime::APPLICATION_PDF {
        "inline"
    } else {
        "attachment"
    };
    let content_type = HeaderValue::from_str(mime.essence_str())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    // Validated filenames carry no quotes, separators or control characters.
    let disposition = HeaderValue::from_str(&format!("{disposition}; filename=\"{filename}\""))
        .unwrap_or(HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Bytes::from(bytes),
    )
        .into_response())
}

/// GET /api/v1/templates
pub async fn handle_list_templates(
    State(state): State<AppState>,
    Query(params): Query<WorkspaceQuery>,
) -> Result<Json<Vec<String>>, AppError> {
    list_inputs(&state, &params.workspace_id, InputCategory::Template).await
}

/// GET /api/v1/profiles
pub async fn handle_list_profiles(
    State(state): State<AppState>,
    Query(params): Query<WorkspaceQuery>,
) -> Result<Json<Vec<String>>, AppError> {
    list_inputs(&state, &params.workspace_id, InputCategory::Profile).await
}

async fn list_inputs(
    state: &AppState,
    workspace: &str,
    category: InputCategory,
) -> Result<Json<Vec<String>>, AppError> {
    let store = state.orchestrator.store();
    store.ensure_workspace(workspace).await?;
    Ok(Json(store.list_inputs(workspace, category).await?))
}

/// GET /api/v1/config
///
/// API keys are masked in the response.
pub async fn handle_get_config(
    State(state): State<AppState>,
    Query(params): Query<WorkspaceQuery>,
) -> Result<Json<WorkspaceConfig>, AppError> {
    let config = state
        .orchestrator
        .store()
        .load_config(&params.workspace_id)
        .await?;
    Ok(Json(config.redacted()))
}

/// PUT /api/v1/config
///
/// A masked key (as returned by GET) keeps the stored key for that item.
pub async fn handle_update_config(
    State(state): State<AppState>,
    Query(params): Query<WorkspaceQuery>,
    Json(mut config): Json<WorkspaceConfig>,
) -> Result<Json<WorkspaceConfig>, AppError> {
    let store = state.orchestrator.store();
    let stored = store.load_config(&params.workspace_id).await?;
    config.keep_secrets_from(&stored);
    store.save_config(&params.workspace_id, &config).await?;
    Ok(Json(config.redacted()))
}
