//! Analyze step: score source text against a job description.
//!
//! Used three ways: synchronously over HTTP, as a standalone job that
//! re-scores a stored version, and as the best-effort post-step of refine.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::extract::extract_profile_text;
use super::prompts::DEFAULT_ANALYZE_PROMPT;
use super::{filename_base, Orchestrator, PipelineError};
use crate::llm_client::prompts::render_template;
use crate::llm_client::resolve::BackendConfig;
use crate::models::results::AnalysisResult;
use crate::models::workflow::{JobResult, WorkflowRow};
use crate::storage::workspace::WorkspaceConfig;
use crate::storage::InputCategory;

/// Re-score one stored version against the workflow's job description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeTask {
    pub version: String,
    pub filename: String,
}

impl Orchestrator {
    async fn analyze_with(
        &self,
        config: &WorkspaceConfig,
        backend: &BackendConfig,
        resume_text: &str,
        job_description: &str,
    ) -> Result<AnalysisResult, PipelineError> {
        let template = config.prompts.analyze().unwrap_or(DEFAULT_ANALYZE_PROMPT);
        let prompt = render_template(
            template,
            &[
                ("resume_text", resume_text),
                ("job_description", job_description),
            ],
        );
        Ok(self.adapter.invoke(backend, &prompt).await?)
    }

    /// Scores `resume_text` with the workspace's selected backend.
    pub async fn analyze_text(
        &self,
        workspace: &str,
        resume_text: &str,
        job_description: &str,
    ) -> Result<AnalysisResult, PipelineError> {
        let (config, backend) = self.workspace_backend(workspace).await?;
        self.analyze_with(&config, &backend, resume_text, job_description)
            .await
    }

    /// Scores a workspace input: the profile when given, otherwise the template.
    pub async fn analyze_inputs(
        &self,
        workspace: &str,
        template: Option<&str>,
        profile: Option<&str>,
        job_description: &str,
    ) -> Result<AnalysisResult, PipelineError> {
        let text = match (profile, template) {
            (Some(profile), _) => {
                let bytes = self
                    .store
                    .read_input(workspace, InputCategory::Profile, profile)
                    .await?;
                extract_profile_text(profile, bytes).await
            }
            (None, Some(template)) => {
                let bytes = self
                    .store
                    .read_input(workspace, InputCategory::Template, template)
                    .await?;
                String::from_utf8_lossy(&bytes).into_owned()
            }
            (None, None) => {
                return Err(PipelineError::Invalid(
                    "either profile_filename or template_filename is required".to_string(),
                ))
            }
        };
        self.analyze_text(workspace, &text, job_description).await
    }

    /// Optional post-step: failures are logged and become `None`.
    pub(crate) async fn reanalyze(
        &self,
        config: &WorkspaceConfig,
        backend: &BackendConfig,
        source: &str,
        job_description: &str,
    ) -> Option<AnalysisResult> {
        match self
            .analyze_with(config, backend, source, job_description)
            .await
        {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                warn!("Re-analysis failed; continuing without a score: {e}");
                None
            }
        }
    }

    pub(crate) async fn analyze_version(
        &self,
        workflow: &WorkflowRow,
        task: &AnalyzeTask,
    ) -> Result<JobResult, PipelineError> {
        let workspace = workflow.workspace_id.as_str();
        let source_name = format!("{}.tex", filename_base(&task.filename));
        let source = self
            .store
            .read_labelled(workspace, workflow.id, &task.version, &source_name)
            .await?;
        let source = String::from_utf8_lossy(&source);

        let analysis = self
            .analyze_text(workspace, &source, &workflow.job_description)
            .await?;
        info!(
            "Workflow {}: {} scored {}",
            workflow.id, task.version, analysis.ats_score
        );

        Ok(JobResult {
            payload: json!({
                "analysis": analysis,
                "workflow_id": workflow.id,
                "version": task.version,
            }),
            staged: None,
        })
    }
}
