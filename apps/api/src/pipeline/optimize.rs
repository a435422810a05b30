//! Optimize pipeline: template + profile + prior analysis → a render staged
//! for `v1`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::extract::extract_profile_text;
use super::prompts::DEFAULT_OPTIMIZE_PROMPT;
use super::{filename_base, Orchestrator, PipelineError};
use crate::llm_client::prompts::render_template;
use crate::models::results::OptimizationResult;
use crate::models::workflow::{JobResult, StagedVersion, VersionClaim, VersionLabel, WorkflowRow};
use crate::render::{sanitize_source, validate_output_name};
use crate::storage::InputCategory;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeTask {
    pub analysis: PriorAnalysis,
    pub output_filename: String,
    #[serde(default)]
    pub ignored_keywords: Vec<String>,
    #[serde(default)]
    pub manual_keywords: Vec<String>,
}

/// The analysis a client ran before optimizing. Lenient: clients may send a
/// trimmed-down copy of an `AnalysisResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorAnalysis {
    #[serde(default)]
    pub ats_score: u32,
    #[serde(default)]
    pub missing_keywords: Vec<String>,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    #[serde(default = "empty_object")]
    pub justification: Value,
}

fn empty_object() -> Value {
    json!({})
}

/// (missing − ignored) ∪ manual, first occurrence wins. Case-sensitive.
pub fn target_keywords(missing: &[String], ignored: &[String], manual: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let candidates = missing
        .iter()
        .filter(|k| !ignored.contains(k))
        .chain(manual.iter());
    for keyword in candidates {
        if !out.contains(keyword) {
            out.push(keyword.clone());
        }
    }
    out
}

impl Orchestrator {
    pub(crate) async fn optimize(
        &self,
        workflow: &WorkflowRow,
        job_id: Uuid,
        task: &OptimizeTask,
    ) -> Result<JobResult, PipelineError> {
        let workspace = workflow.workspace_id.as_str();
        let output_base = filename_base(&task.output_filename);
        validate_output_name(output_base)?;
        let (config, backend) = self.workspace_backend(workspace).await?;

        let template = self
            .store
            .read_input(workspace, InputCategory::Template, &workflow.template_filename)
            .await?;
        let resume_text = String::from_utf8_lossy(&template).into_owned();

        let profile_text = match &workflow.profile_filename {
            Some(profile) => {
                let bytes = self
                    .store
                    .read_input(workspace, InputCategory::Profile, profile)
                    .await?;
                extract_profile_text(profile, bytes).await
            }
            None => String::new(),
        };
        if workflow.profile_filename.is_some() && profile_text.trim().is_empty() {
            warn!("Workflow {}: profile text is empty", workflow.id);
        }

        let keywords = target_keywords(
            &task.analysis.missing_keywords,
            &task.ignored_keywords,
            &task.manual_keywords,
        );
        let score = task.analysis.ats_score.to_string();
        let missing = keywords.join(", ");
        let matched = task.analysis.matched_keywords.join(", ");
        let justification = task.analysis.justification.to_string();

        let template = config.prompts.optimize().unwrap_or(DEFAULT_OPTIMIZE_PROMPT);
        let prompt = render_template(
            template,
            &[
                ("initial_ats_score", score.as_str()),
                ("missing_keywords", missing.as_str()),
                ("matched_keywords", matched.as_str()),
                ("justification", justification.as_str()),
                ("job_description", workflow.job_description.as_str()),
                ("resume_text", resume_text.as_str()),
                ("profile_text", profile_text.as_str()),
            ],
        );

        let mut optimization: OptimizationResult = self.adapter.invoke(&backend, &prompt).await?;
        optimization.new_latex_code = sanitize_source(&optimization.new_latex_code);

        let compilation = self
            .renderer
            .compile(
                workspace,
                workflow.id,
                job_id,
                output_base,
                &optimization.new_latex_code,
            )
            .await?;
        info!(
            "Workflow {}: optimized to score {} (rendered: {})",
            workflow.id, optimization.final_score, compilation.success
        );

        Ok(JobResult {
            payload: json!({
                "optimization": optimization,
                "compilation": compilation,
                "workflow_id": workflow.id,
                "version": null,
                "target_keywords": keywords,
            }),
            staged: Some(StagedVersion {
                workspace: workspace.to_string(),
                token: job_id,
                claim: VersionClaim::Exact(VersionLabel::FIRST.number()),
            }),
        })
    }
}
