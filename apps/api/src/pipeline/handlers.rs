use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::compile::ManualCompile;
use super::optimize::PriorAnalysis;
use super::{AnalyzeTask, OptimizeTask, RefineTask, Task};
use crate::errors::AppError;
use crate::ledger::Ledger;
use crate::models::results::AnalysisResult;
use crate::models::workflow::{
    JobRow, JobStatus, NewWorkflow, Pagination, VersionLabel, WorkflowDetail, WorkflowRow,
};
use crate::state::AppState;
use crate::storage::validate_identifier;

/// Caller identity. Authentication is handled upstream.
#[derive(Deserialize)]
pub struct CallerQuery {
    pub user_id: Uuid,
    pub workspace_id: String,
}

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct ListWorkflowsQuery {
    pub user_id: Uuid,
    #[serde(default)]
    pub skip: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Returned by every endpoint that enqueues a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub status: JobStatus,
}

fn submitted(job_id: Uuid, workflow_id: Uuid) -> (StatusCode, Json<SubmittedJob>) {
    (
        StatusCode::ACCEPTED,
        Json(SubmittedJob {
            job_id,
            workflow_id,
            status: JobStatus::Pending,
        }),
    )
}

fn default_output_filename() -> String {
    "optimized_resume".to_string()
}

#[derive(Deserialize)]
pub struct AnalyzeRequest {
    /// Raw text to score. Takes precedence over the workspace files.
    #[serde(default)]
    pub resume_text: Option<String>,
    #[serde(default)]
    pub template_filename: Option<String>,
    #[serde(default)]
    pub profile_filename: Option<String>,
    pub job_description: String,
}

/// POST /api/v1/analyze
pub async fn handle_analyze(
    State(state): State<AppState>,
    Query(caller): Query<CallerQuery>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<AnalysisResult>, AppError> {
    let orchestrator = &state.orchestrator;
    let analysis = match req.resume_text.as_deref() {
        Some(text) => {
            orchestrator
                .analyze_text(&caller.workspace_id, text, &req.job_description)
                .await?
        }
        None => {
            orchestrator
                .analyze_inputs(
                    &caller.workspace_id,
                    req.template_filename.as_deref(),
                    req.profile_filename.as_deref(),
                    &req.job_description,
                )
                .await?
        }
    };
    Ok(Json(analysis))
}

#[derive(Deserialize)]
pub struct OptimizeRequest {
    pub template_filename: String,
    #[serde(default)]
    pub profile_filename: Option<String>,
    pub job_description: String,
    pub analysis: PriorAnalysis,
    #[serde(default = "default_output_filename")]
    pub output_filename: String,
    #[serde(default)]
    pub ignored_keywords: Vec<String>,
    #[serde(default)]
    pub manual_keywords: Vec<String>,
}

/// POST /api/v1/optimize
pub async fn handle_optimize(
    State(state): State<AppState>,
    Query(caller): Query<CallerQuery>,
    Json(req): Json<OptimizeRequest>,
) -> Result<(StatusCode, Json<SubmittedJob>), AppError> {
    validate_identifier("workspace id", &caller.workspace_id)?;
    validate_identifier("filename", &req.template_filename)?;
    validate_identifier("filename", &req.output_filename)?;
    if let Some(profile) = &req.profile_filename {
        validate_identifier("filename", profile)?;
    }
    // Configuration problems surface here, before any job exists.
    state
        .orchestrator
        .workspace_backend(&caller.workspace_id)
        .await?;

    let workflow = state
        .orchestrator
        .ledger()
        .create_workflow(NewWorkflow {
            user_id: caller.user_id,
            workspace_id: caller.workspace_id,
            job_description: req.job_description,
            template_filename: req.template_filename,
            profile_filename: req.profile_filename,
        })
        .await?;

    let task = Task::Optimize(OptimizeTask {
        analysis: req.analysis,
        output_filename: req.output_filename,
        ignored_keywords: req.ignored_keywords,
        manual_keywords: req.manual_keywords,
    });
    let job_id = state.dispatcher.submit(workflow.id, task).await?;
    Ok(submitted(job_id, workflow.id))
}

#[derive(Deserialize)]
pub struct RefineRequest {
    pub workflow_id: Uuid,
    pub current_version: String,
    pub current_filename: String,
    pub user_request: String,
    #[serde(default)]
    pub output_filename: Option<String>,
    #[serde(default)]
    pub job_description: Option<String>,
    #[serde(default)]
    pub target_version: Option<VersionLabel>,
}

/// POST /api/v1/refine
pub async fn handle_refine(
    State(state): State<AppState>,
    Query(caller): Query<UserIdQuery>,
    Json(req): Json<RefineRequest>,
) -> Result<(StatusCode, Json<SubmittedJob>), AppError> {
    let workflow = owned_workflow(&state, req.workflow_id, caller.user_id).await?;
    validate_identifier("version", &req.current_version)?;
    validate_identifier("filename", &req.current_filename)?;
    let output_filename = req
        .output_filename
        .unwrap_or_else(|| req.current_filename.clone());
    validate_identifier("filename", &output_filename)?;
    if req.user_request.trim().is_empty() {
        return Err(AppError::Validation(
            "user_request must not be empty".to_string(),
        ));
    }
    state
        .orchestrator
        .workspace_backend(&workflow.workspace_id)
        .await?;

    let task = Task::Refine(RefineTask {
        current_version: req.current_version,
        current_filename: req.current_filename,
        user_request: req.user_request,
        output_filename,
        job_description: req.job_description,
        target_version: req.target_version,
    });
    let job_id = state.dispatcher.submit(workflow.id, task).await?;
    Ok(submitted(job_id, workflow.id))
}

/// GET /api/v1/jobs/:id
pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(caller): Query<UserIdQuery>,
) -> Result<Json<JobRow>, AppError> {
    let job = state
        .orchestrator
        .ledger()
        .get_job(id, caller.user_id)
        .await?;
    Ok(Json(job))
}

/// GET /api/v1/workflows
pub async fn handle_list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListWorkflowsQuery>,
) -> Result<Json<Vec<WorkflowRow>>, AppError> {
    let defaults = Pagination::default();
    let page = Pagination {
        skip: params.skip.unwrap_or(defaults.skip),
        limit: params.limit.unwrap_or(defaults.limit),
    }
    .clamped();
    let workflows = state
        .orchestrator
        .ledger()
        .list_workflows(params.user_id, page)
        .await?;
    Ok(Json(workflows))
}

/// GET /api/v1/workflows/:id
pub async fn handle_get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(caller): Query<UserIdQuery>,
) -> Result<Json<WorkflowDetail>, AppError> {
    let detail = state
        .orchestrator
        .ledger()
        .workflow_detail(id, caller.user_id)
        .await?;
    Ok(Json(detail))
}

/// POST /api/v1/workflows/:id/analyze
pub async fn handle_analyze_version(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(caller): Query<UserIdQuery>,
    Json(req): Json<AnalyzeTask>,
) -> Result<(StatusCode, Json<SubmittedJob>), AppError> {
    let workflow = owned_workflow(&state, id, caller.user_id).await?;
    validate_identifier("version", &req.version)?;
    validate_identifier("filename", &req.filename)?;
    state
        .orchestrator
        .workspace_backend(&workflow.workspace_id)
        .await?;

    let job_id = state
        .dispatcher
        .submit(workflow.id, Task::Analyze(req))
        .await?;
    Ok(submitted(job_id, workflow.id))
}

#[derive(Deserialize)]
pub struct CompileRequest {
    pub latex_code: String,
    #[serde(default = "default_output_filename")]
    pub output_filename: String,
    #[serde(default)]
    pub target_version: Option<VersionLabel>,
}

/// POST /api/v1/workflows/:id/compile
pub async fn handle_compile(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(caller): Query<UserIdQuery>,
    Json(req): Json<CompileRequest>,
) -> Result<Json<ManualCompile>, AppError> {
    let workflow = owned_workflow(&state, id, caller.user_id).await?;
    let compiled = state
        .orchestrator
        .compile_manual(
            &workflow,
            &req.latex_code,
            &req.output_filename,
            req.target_version,
        )
        .await?;
    Ok(Json(compiled))
}

pub(crate) async fn owned_workflow(
    state: &AppState,
    id: Uuid,
    user_id: Uuid,
) -> Result<WorkflowRow, AppError> {
    Ok(state
        .orchestrator
        .ledger()
        .get_workflow(id, user_id)
        .await?)
}
