//! Manual compile: user-edited source becomes a new version synchronously.

use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::publish::StagedPublication;
use super::{filename_base, Orchestrator, PipelineError};
use crate::models::workflow::{VersionClaim, VersionLabel, WorkflowRow};
use crate::render::{sanitize_source, validate_output_name, CompileOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct ManualCompile {
    pub compilation: CompileOutcome,
    pub workflow_id: Uuid,
    pub version: VersionLabel,
}

impl Orchestrator {
    pub async fn compile_manual(
        &self,
        workflow: &WorkflowRow,
        source: &str,
        output_filename: &str,
        target_version: Option<VersionLabel>,
    ) -> Result<ManualCompile, PipelineError> {
        let source = sanitize_source(source);
        if source.trim().is_empty() {
            return Err(PipelineError::Invalid("latex_code must not be empty".to_string()));
        }
        let output_base = filename_base(output_filename);
        validate_output_name(output_base)?;

        let claim = match target_version {
            Some(target) => VersionClaim::Exact(target.number()),
            None => VersionClaim::Next { floor: 1 },
        };
        let workspace = workflow.workspace_id.as_str();
        let token = Uuid::new_v4();
        let mut compilation = self
            .renderer
            .compile(workspace, workflow.id, token, output_base, &source)
            .await?;

        let publication = StagedPublication {
            store: &self.store,
            workspace,
            workflow_id: workflow.id,
            token,
            payload: json!({ "compilation": compilation }),
        };
        let version = match self
            .ledger
            .publish_version(workflow.id, claim, &publication)
            .await
        {
            Ok(version) => version,
            Err(e) => {
                self.discard_staged(workspace, workflow.id, token).await;
                return Err(e.into());
            }
        };
        compilation.relocate(
            &self.store.staging_dir(workspace, workflow.id, token)?,
            &self.store.version_dir(workspace, workflow.id, version)?,
        );
        info!(
            "Workflow {}: manual compile into {version} (rendered: {})",
            workflow.id, compilation.success
        );

        Ok(ManualCompile {
            compilation,
            workflow_id: workflow.id,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::models::workflow::NewWorkflow;
    use crate::pipeline::testing::{harness, Harness, Typesetter, WORKSPACE};

    async fn workflow(h: &Harness, user: Uuid, counter: i32) -> WorkflowRow {
        let workflow = h
            .ledger
            .create_workflow(NewWorkflow {
                user_id: user,
                workspace_id: WORKSPACE.to_string(),
                job_description: "JD".to_string(),
                template_filename: "resume.tex".to_string(),
                profile_filename: None,
            })
            .await
            .unwrap();
        h.ledger.set_version_counter(workflow.id, counter);
        workflow
    }

    fn output_entries(h: &Harness, workflow: &WorkflowRow) -> Vec<String> {
        let dir = h
            .dir
            .path()
            .join("users")
            .join(WORKSPACE)
            .join("output")
            .join(workflow.id.to_string());
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_manual_compile_appends_and_records_version() {
        let h = harness(Typesetter::Working).await;
        let user = Uuid::new_v4();
        let workflow = workflow(&h, user, 1).await;

        let compiled = h
            .orchestrator
            .compile_manual(&workflow, "\\section{Edited}\0", "Resume.tex", None)
            .await
            .unwrap();

        assert_eq!(compiled.version.to_string(), "v2");
        assert!(compiled.compilation.success);
        assert!(compiled.compilation.tex_path.ends_with("v2/Resume.tex"));
        let written = std::fs::read_to_string(&compiled.compilation.tex_path).unwrap();
        assert_eq!(written, "\\section{Edited}");

        let detail = h.ledger.workflow_detail(workflow.id, user).await.unwrap();
        assert_eq!(detail.versions.len(), 1);
        assert_eq!(detail.versions[0].label, "v2");
        assert!(detail.versions[0].job_id.is_none());
        assert_eq!(output_entries(&h, &workflow), vec!["v2"]);
    }

    #[tokio::test]
    async fn test_manual_compile_rejects_taken_version_without_files() {
        let h = harness(Typesetter::Working).await;
        let workflow = workflow(&h, Uuid::new_v4(), 2).await;

        let err = h
            .orchestrator
            .compile_manual(&workflow, "x", "Resume", VersionLabel::new(2))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Ledger(_)));
        assert!(output_entries(&h, &workflow).is_empty());
    }

    #[tokio::test]
    async fn test_bad_output_filename_consumes_no_version() {
        let h = harness(Typesetter::Working).await;
        let workflow = workflow(&h, Uuid::new_v4(), 1).await;

        let err = h
            .orchestrator
            .compile_manual(&workflow, "x", "../Resume", None)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Render(_)));
        let counter = h.ledger.load_workflow(workflow.id).await.unwrap().version_counter;
        assert_eq!(counter, 1);
        assert!(output_entries(&h, &workflow).is_empty());
    }
}
