//! Orchestrator: sequences generation, rendering and ledger updates for
//! one job.
//!
//! Each task variant runs one pipeline to completion or failure. Pipelines
//! never write a job's terminal state themselves; they return a `JobResult`
//! (or an error) and the dispatcher hands it to [`Orchestrator::finish`].
//! Renders are staged under the job id and only become a numbered version
//! when the job completes.

pub mod analyze;
pub mod compile;
pub mod extract;
pub mod handlers;
pub mod optimize;
pub mod prompts;
pub mod publish;
pub mod refine;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ledger::{Ledger, LedgerError};
use crate::llm_client::resolve::{resolve_backend, BackendCatalog, BackendConfig, ConfigError};
use crate::llm_client::{GenerationAdapter, LlmError};
use crate::models::workflow::{JobKind, JobResult};
use crate::render::{RenderError, RenderService};
use crate::storage::workspace::WorkspaceConfig;
use crate::storage::{ArtifactStore, StorageError};

pub use analyze::AnalyzeTask;
pub use optimize::OptimizeTask;
pub use refine::RefineTask;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// Work carried on the queue. The workflow id travels in the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Optimize(OptimizeTask),
    Refine(RefineTask),
    Analyze(AnalyzeTask),
}

impl Task {
    pub fn kind(&self) -> JobKind {
        match self {
            Task::Optimize(_) => JobKind::Optimize,
            Task::Refine(_) => JobKind::Refine,
            Task::Analyze(_) => JobKind::Analyze,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    store: ArtifactStore,
    renderer: RenderService,
    adapter: GenerationAdapter,
    catalog: Arc<BackendCatalog>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: ArtifactStore,
        renderer: RenderService,
        adapter: GenerationAdapter,
        catalog: Arc<BackendCatalog>,
    ) -> Self {
        Self {
            ledger,
            store,
            renderer,
            adapter,
            catalog,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Loads the workspace config and resolves its selected backend.
    pub async fn workspace_backend(
        &self,
        workspace: &str,
    ) -> Result<(WorkspaceConfig, BackendConfig), PipelineError> {
        let config = self.store.load_config(workspace).await?;
        let backend = resolve_backend(&config, &self.catalog)?;
        Ok((config, backend))
    }

    /// Runs the pipeline for one dequeued task.
    pub async fn run(
        &self,
        job_id: Uuid,
        workflow_id: Uuid,
        task: &Task,
    ) -> Result<JobResult, PipelineError> {
        let workflow = self.ledger.load_workflow(workflow_id).await?;
        info!(
            "Job {job_id}: starting {} pipeline for workflow {workflow_id}",
            task.kind().as_str()
        );

        let result = match task {
            Task::Optimize(task) => self.optimize(&workflow, job_id, task).await,
            Task::Refine(task) => self.refine(&workflow, job_id, task).await,
            Task::Analyze(task) => self.analyze_version(&workflow, task).await,
        };

        match &result {
            Ok(result) if result.staged.is_some() => {
                info!("Job {job_id}: render staged for workflow {workflow_id}")
            }
            Ok(_) => info!("Job {job_id}: finished for workflow {workflow_id}"),
            Err(e) => {
                warn!("Job {job_id}: pipeline failed: {e}");
                self.discard_staged(&workflow.workspace_id, workflow_id, job_id)
                    .await;
            }
        }
        result
    }
}

/// Strips a trailing `.tex` so callers may pass either spelling.
fn filename_base(name: &str) -> &str {
    name.strip_suffix(".tex").unwrap_or(name)
}
