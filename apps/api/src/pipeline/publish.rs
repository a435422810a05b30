//! Promotion of a staged render once the ledger has assigned its number.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::Orchestrator;
use crate::ledger::{LedgerError, VersionPublisher};
use crate::models::workflow::{JobResult, Transition, VersionLabel};
use crate::render::CompileOutcome;
use crate::storage::ArtifactStore;

/// Renames `.staging-{token}` to the assigned version and stamps the payload.
pub(crate) struct StagedPublication<'a> {
    pub store: &'a ArtifactStore,
    pub workspace: &'a str,
    pub workflow_id: Uuid,
    pub token: Uuid,
    pub payload: Value,
}

#[async_trait]
impl VersionPublisher for StagedPublication<'_> {
    async fn publish(&self, version: VersionLabel) -> Result<Value, LedgerError> {
        let (from, to) = self
            .store
            .promote(self.workspace, self.workflow_id, self.token, version)
            .await
            .map_err(|e| LedgerError::Publish(e.to_string()))?;

        let mut payload = self.payload.clone();
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("version".to_string(), json!(version));
            if let Some(compilation) = fields.get_mut("compilation") {
                relocate_compilation(compilation, &from, &to);
            }
        }
        Ok(payload)
    }

    async fn revert(&self, version: VersionLabel) {
        if let Err(e) = self
            .store
            .demote(self.workspace, self.workflow_id, self.token, version)
            .await
        {
            warn!(
                "Could not move {}/{version} back to staging: {e}",
                self.workflow_id
            );
        }
    }
}

fn relocate_compilation(compilation: &mut Value, from: &Path, to: &Path) {
    let Ok(mut outcome) = serde_json::from_value::<CompileOutcome>(compilation.clone()) else {
        return;
    };
    outcome.relocate(from, to);
    if let Ok(moved) = serde_json::to_value(outcome) {
        *compilation = moved;
    }
}

impl Orchestrator {
    /// Records a pipeline's result. A staged render is promoted to its version
    /// inside the ledger's completion; if that does not happen the staging
    /// directory is removed.
    pub async fn finish(
        &self,
        job_id: Uuid,
        workflow_id: Uuid,
        result: JobResult,
    ) -> Result<Transition, LedgerError> {
        let Some(staged) = result.staged else {
            return self.ledger.complete_job(job_id, result.payload).await;
        };

        let publication = StagedPublication {
            store: &self.store,
            workspace: &staged.workspace,
            workflow_id,
            token: staged.token,
            payload: result.payload,
        };
        let outcome = self
            .ledger
            .complete_versioned_job(job_id, staged.claim, &publication)
            .await;
        if !matches!(outcome, Ok(Transition::Applied)) {
            self.discard_staged(&staged.workspace, workflow_id, staged.token)
                .await;
        }
        outcome
    }

    pub(crate) async fn discard_staged(&self, workspace: &str, workflow_id: Uuid, token: Uuid) {
        if let Err(e) = self.store.discard_staged(workspace, workflow_id, token).await {
            warn!("Could not discard staged render {token} of workflow {workflow_id}: {e}");
        }
    }
}
