//! Refine pipeline: apply a free-text instruction to an existing version and
//! stage the result for the next version.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::prompts::DEFAULT_REFINE_PROMPT;
use super::{filename_base, Orchestrator, PipelineError};
use crate::llm_client::prompts::render_template;
use crate::models::results::RefineResult;
use crate::models::workflow::{
    derive_next_label, JobResult, StagedVersion, VersionClaim, VersionLabel, WorkflowRow,
};
use crate::render::{sanitize_source, validate_output_name};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineTask {
    /// Raw label of the version to start from, usually `v<N>`.
    pub current_version: String,
    /// Source file base name inside that version, with or without `.tex`.
    pub current_filename: String,
    pub user_request: String,
    pub output_filename: String,
    /// Re-scoring target. Defaults to the workflow's job description.
    #[serde(default)]
    pub job_description: Option<String>,
    #[serde(default)]
    pub target_version: Option<VersionLabel>,
}

impl RefineTask {
    /// How this refine asks the ledger for its version number.
    pub fn version_claim(&self) -> VersionClaim {
        match self.target_version {
            Some(target) => VersionClaim::Exact(target.number()),
            None => VersionClaim::Next {
                floor: derive_next_label(&self.current_version).number(),
            },
        }
    }
}

impl Orchestrator {
    pub(crate) async fn refine(
        &self,
        workflow: &WorkflowRow,
        job_id: Uuid,
        task: &RefineTask,
    ) -> Result<JobResult, PipelineError> {
        let workspace = workflow.workspace_id.as_str();
        let output_base = filename_base(&task.output_filename);
        validate_output_name(output_base)?;
        let (config, backend) = self.workspace_backend(workspace).await?;

        let source_name = format!("{}.tex", filename_base(&task.current_filename));
        let current = self
            .store
            .read_labelled(workspace, workflow.id, &task.current_version, &source_name)
            .await?;
        let current_tex = String::from_utf8_lossy(&current).into_owned();

        let job_description = task
            .job_description
            .as_deref()
            .unwrap_or(workflow.job_description.as_str());
        let template = config.prompts.refine().unwrap_or(DEFAULT_REFINE_PROMPT);
        let prompt = render_template(
            template,
            &[
                ("current_tex", current_tex.as_str()),
                ("resume_text", current_tex.as_str()),
                ("user_request", task.user_request.as_str()),
                ("job_description", job_description),
            ],
        );

        let mut refinement: RefineResult = self.adapter.invoke(&backend, &prompt).await?;
        refinement.new_latex_code = sanitize_source(&refinement.new_latex_code);

        let compilation = self
            .renderer
            .compile(
                workspace,
                workflow.id,
                job_id,
                output_base,
                &refinement.new_latex_code,
            )
            .await?;
        info!(
            "Workflow {}: refined {} (rendered: {})",
            workflow.id, task.current_version, compilation.success
        );

        let analysis = self
            .reanalyze(&config, &backend, &refinement.new_latex_code, job_description)
            .await;

        Ok(JobResult {
            payload: json!({
                "refinement": refinement,
                "compilation": compilation,
                "analysis": analysis,
                "workflow_id": workflow.id,
                "version": null,
            }),
            staged: Some(StagedVersion {
                workspace: workspace.to_string(),
                token: job_id,
                claim: task.version_claim(),
            }),
        })
    }
}
