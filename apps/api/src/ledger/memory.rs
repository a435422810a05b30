//! In-memory ledger with the same semantics as `PgLedger`, for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{resolve_claim, to_db_int, Ledger, LedgerError, VersionPublisher};
use crate::models::workflow::{
    JobKind, JobRow, JobStatus, NewWorkflow, Pagination, Transition, VersionClaim, VersionLabel,
    VersionRow, WorkflowRow,
};

#[derive(Default)]
struct State {
    workflows: HashMap<Uuid, WorkflowRow>,
    jobs: HashMap<Uuid, JobRow>,
    versions: Vec<VersionRow>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
    /// Stands in for the workflow row lock while a publish is awaited.
    publish_lock: tokio::sync::Mutex<()>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: Uuid) -> Option<JobRow> {
        self.state.lock().unwrap().jobs.get(&id).cloned()
    }

    /// Seeds a workflow as if `counter` versions had already been handed out.
    pub fn set_version_counter(&self, workflow_id: Uuid, counter: i32) {
        if let Some(workflow) = self.state.lock().unwrap().workflows.get_mut(&workflow_id) {
            workflow.version_counter = counter;
        }
    }

    fn finish(
        &self,
        id: Uuid,
        status: JobStatus,
        payload: Option<Value>,
        error: Option<String>,
    ) -> Result<Transition, LedgerError> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("Job {id}")))?;
        let current = job.status();
        if current.is_terminal() {
            return Ok(Transition::AlreadyTerminal(current));
        }
        job.status = status.as_str().to_string();
        job.result_data = payload;
        job.error_message = error;
        job.updated_at = Utc::now();
        Ok(Transition::Applied)
    }

    /// Caller holds `publish_lock`.
    async fn publish_locked(
        &self,
        workflow_id: Uuid,
        job_id: Option<Uuid>,
        claim: VersionClaim,
        publisher: &dyn VersionPublisher,
    ) -> Result<(VersionLabel, Transition), LedgerError> {
        let counter = self
            .state
            .lock()
            .unwrap()
            .workflows
            .get(&workflow_id)
            .map(|w| w.version_counter)
            .ok_or_else(|| LedgerError::NotFound(format!("Workflow {workflow_id}")))?;
        let version = resolve_claim(workflow_id, claim, counter)?;

        let payload = publisher.publish(version).await?;

        let terminal = {
            let mut state = self.state.lock().unwrap();
            let terminal = job_id
                .and_then(|id| state.jobs.get(&id))
                .map(|job| job.status())
                .filter(|status| status.is_terminal());
            if terminal.is_none() {
                if let Some(workflow) = state.workflows.get_mut(&workflow_id) {
                    workflow.version_counter = to_db_int(version.number());
                }
                state.versions.push(VersionRow {
                    workflow_id,
                    version: to_db_int(version.number()),
                    label: version.to_string(),
                    job_id,
                    created_at: Utc::now(),
                });
                if let Some(job) = job_id.and_then(|id| state.jobs.get_mut(&id)) {
                    job.status = JobStatus::Success.as_str().to_string();
                    job.result_data = Some(payload);
                    job.updated_at = Utc::now();
                }
            }
            terminal
        };

        match terminal {
            Some(status) => {
                publisher.revert(version).await;
                Ok((version, Transition::AlreadyTerminal(status)))
            }
            None => Ok((version, Transition::Applied)),
        }
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowRow, LedgerError> {
        let row = WorkflowRow {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            workspace_id: new.workspace_id,
            job_description: new.job_description,
            template_filename: new.template_filename,
            profile_filename: new.profile_filename,
            version_counter: 0,
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .workflows
            .insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid, user_id: Uuid) -> Result<WorkflowRow, LedgerError> {
        self.state
            .lock()
            .unwrap()
            .workflows
            .get(&id)
            .filter(|w| w.user_id == user_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("Workflow {id}")))
    }

    async fn load_workflow(&self, id: Uuid) -> Result<WorkflowRow, LedgerError> {
        self.state
            .lock()
            .unwrap()
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("Workflow {id}")))
    }

    async fn list_workflows(
        &self,
        user_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<WorkflowRow>, LedgerError> {
        let page = page.clamped();
        let state = self.state.lock().unwrap();
        let mut rows: Vec<WorkflowRow> = state
            .workflows
            .values()
            .filter(|w| w.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(page.skip as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn list_jobs(&self, workflow_id: Uuid) -> Result<Vec<JobRow>, LedgerError> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<JobRow> = state
            .jobs
            .values()
            .filter(|j| j.workflow_id == workflow_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<VersionRow>, LedgerError> {
        let state = self.state.lock().unwrap();
        let mut versions: Vec<VersionRow> = state
            .versions
            .iter()
            .filter(|v| v.workflow_id == workflow_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    async fn create_job(
        &self,
        id: Uuid,
        workflow_id: Uuid,
        kind: JobKind,
    ) -> Result<JobRow, LedgerError> {
        let mut state = self.state.lock().unwrap();
        if !state.workflows.contains_key(&workflow_id) {
            return Err(LedgerError::NotFound(format!("Workflow {workflow_id}")));
        }
        let now = Utc::now();
        let row = JobRow {
            id,
            workflow_id,
            kind: kind.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            result_data: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(id, row.clone());
        Ok(row)
    }

    async fn get_job(&self, id: Uuid, user_id: Uuid) -> Result<JobRow, LedgerError> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .get(&id)
            .filter(|j| {
                state
                    .workflows
                    .get(&j.workflow_id)
                    .map(|w| w.user_id == user_id)
                    .unwrap_or(false)
            })
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("Job {id}")))
    }

    async fn complete_job(&self, id: Uuid, payload: Value) -> Result<Transition, LedgerError> {
        self.finish(id, JobStatus::Success, Some(payload), None)
    }

    async fn complete_versioned_job(
        &self,
        id: Uuid,
        claim: VersionClaim,
        publisher: &dyn VersionPublisher,
    ) -> Result<Transition, LedgerError> {
        let _guard = self.publish_lock.lock().await;
        let job = self
            .job(id)
            .ok_or_else(|| LedgerError::NotFound(format!("Job {id}")))?;
        if job.status().is_terminal() {
            return Ok(Transition::AlreadyTerminal(job.status()));
        }
        let (_, transition) = self
            .publish_locked(job.workflow_id, Some(id), claim, publisher)
            .await?;
        Ok(transition)
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<Transition, LedgerError> {
        self.finish(id, JobStatus::Failed, None, Some(error.to_string()))
    }

    async fn publish_version(
        &self,
        workflow_id: Uuid,
        claim: VersionClaim,
        publisher: &dyn VersionPublisher,
    ) -> Result<VersionLabel, LedgerError> {
        let _guard = self.publish_lock.lock().await;
        let (version, _) = self
            .publish_locked(workflow_id, None, claim, publisher)
            .await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn new_workflow(user_id: Uuid) -> NewWorkflow {
        NewWorkflow {
            user_id,
            workspace_id: "alice".to_string(),
            job_description: "Rust engineer".to_string(),
            template_filename: "resume.tex".to_string(),
            profile_filename: None,
        }
    }

    /// Records what it was asked to publish and revert.
    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<VersionLabel>>,
        reverted: Mutex<Vec<VersionLabel>>,
        /// Fails this job from inside `publish`, like a concurrent writer.
        fail_during_publish: Option<(Arc<MemoryLedger>, Uuid)>,
    }

    #[async_trait]
    impl VersionPublisher for Recorder {
        async fn publish(&self, version: VersionLabel) -> Result<Value, LedgerError> {
            self.published.lock().unwrap().push(version);
            if let Some((ledger, job_id)) = &self.fail_during_publish {
                ledger.fail_job(*job_id, "cancelled").await?;
            }
            Ok(json!({ "version": version }))
        }

        async fn revert(&self, version: VersionLabel) {
            self.reverted.lock().unwrap().push(version);
        }
    }

    async fn pending_job(ledger: &MemoryLedger, workflow_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        ledger.create_job(id, workflow_id, JobKind::Refine).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_terminal_job_is_never_overwritten() {
        let ledger = MemoryLedger::new();
        let workflow = ledger.create_workflow(new_workflow(Uuid::new_v4())).await.unwrap();
        let job_id = pending_job(&ledger, workflow.id).await;

        let first = ledger.complete_job(job_id, json!({"ok": 1})).await.unwrap();
        assert_eq!(first, Transition::Applied);

        let second = ledger.fail_job(job_id, "late failure").await.unwrap();
        assert_eq!(second, Transition::AlreadyTerminal(JobStatus::Success));
        let third = ledger.complete_job(job_id, json!({"ok": 2})).await.unwrap();
        assert_eq!(third, Transition::AlreadyTerminal(JobStatus::Success));
        let recorder = Recorder::default();
        let fourth = ledger
            .complete_versioned_job(job_id, VersionClaim::Next { floor: 1 }, &recorder)
            .await
            .unwrap();
        assert_eq!(fourth, Transition::AlreadyTerminal(JobStatus::Success));
        assert!(recorder.published.lock().unwrap().is_empty());

        let job = ledger.job(job_id).unwrap();
        assert_eq!(job.status(), JobStatus::Success);
        assert_eq!(job.result_data, Some(json!({"ok": 1})));
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn test_foreign_workflow_is_not_found() {
        let ledger = MemoryLedger::new();
        let (user_a, user_b) = (Uuid::new_v4(), Uuid::new_v4());
        let workflow = ledger.create_workflow(new_workflow(user_a)).await.unwrap();
        let job_id = pending_job(&ledger, workflow.id).await;

        assert!(ledger.get_workflow(workflow.id, user_a).await.is_ok());
        assert!(matches!(
            ledger.get_workflow(workflow.id, user_b).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(matches!(
            ledger.get_job(job_id, user_b).await,
            Err(LedgerError::NotFound(_))
        ));
        assert!(ledger
            .list_workflows(user_b, Pagination::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_completions_get_distinct_increasing_versions() {
        let ledger = Arc::new(MemoryLedger::new());
        let workflow = ledger.create_workflow(new_workflow(Uuid::new_v4())).await.unwrap();
        ledger
            .publish_version(workflow.id, VersionClaim::Exact(1), &Recorder::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let job_id = pending_job(&ledger, workflow.id).await;
            handles.push(tokio::spawn(async move {
                ledger
                    .complete_versioned_job(job_id, VersionClaim::Next { floor: 2 }, &Recorder::default())
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Transition::Applied);
        }

        let versions = ledger.list_versions(workflow.id).await.unwrap();
        let numbers: Vec<i32> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, (1..=9).collect::<Vec<i32>>());
        assert!(versions.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_versions_follow_completion_order_not_start_order() {
        let ledger = MemoryLedger::new();
        let workflow = ledger.create_workflow(new_workflow(Uuid::new_v4())).await.unwrap();
        let started_first = pending_job(&ledger, workflow.id).await;
        let started_second = pending_job(&ledger, workflow.id).await;

        let claim = VersionClaim::Next { floor: 2 };
        ledger
            .complete_versioned_job(started_second, claim, &Recorder::default())
            .await
            .unwrap();
        ledger
            .complete_versioned_job(started_first, claim, &Recorder::default())
            .await
            .unwrap();

        let versions = ledger.list_versions(workflow.id).await.unwrap();
        assert_eq!(versions[0].label, "v2");
        assert_eq!(versions[0].job_id, Some(started_second));
        assert_eq!(versions[1].label, "v3");
        assert_eq!(versions[1].job_id, Some(started_first));
        assert!(versions[0].created_at <= versions[1].created_at);
        assert_eq!(
            ledger.job(started_first).unwrap().result_data,
            Some(json!({"version": "v3"}))
        );
    }

    #[tokio::test]
    async fn test_failed_job_leaves_no_gap() {
        let ledger = MemoryLedger::new();
        let workflow = ledger.create_workflow(new_workflow(Uuid::new_v4())).await.unwrap();
        let doomed = pending_job(&ledger, workflow.id).await;
        let survivor = pending_job(&ledger, workflow.id).await;

        ledger.fail_job(doomed, "backend unavailable").await.unwrap();
        ledger
            .complete_versioned_job(survivor, VersionClaim::Next { floor: 1 }, &Recorder::default())
            .await
            .unwrap();

        let labels: Vec<String> = ledger
            .list_versions(workflow.id)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.label)
            .collect();
        assert_eq!(labels, vec!["v1"]);
    }

    #[tokio::test]
    async fn test_exact_claim_below_counter_conflicts_without_publishing() {
        let ledger = MemoryLedger::new();
        let workflow = ledger.create_workflow(new_workflow(Uuid::new_v4())).await.unwrap();
        ledger
            .publish_version(workflow.id, VersionClaim::Exact(3), &Recorder::default())
            .await
            .unwrap();

        let job_id = pending_job(&ledger, workflow.id).await;
        let recorder = Recorder::default();
        let err = ledger
            .complete_versioned_job(job_id, VersionClaim::Exact(3), &recorder)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::VersionConflict { requested: 3, current: 3 }
        ));
        assert!(recorder.published.lock().unwrap().is_empty());
        assert_eq!(ledger.job(job_id).unwrap().status(), JobStatus::Pending);

        let next = ledger
            .publish_version(workflow.id, VersionClaim::Next { floor: 2 }, &Recorder::default())
            .await
            .unwrap();
        assert_eq!(next.to_string(), "v4");
    }

    #[tokio::test]
    async fn test_job_failed_during_publish_is_reverted() {
        let ledger = Arc::new(MemoryLedger::new());
        let workflow = ledger.create_workflow(new_workflow(Uuid::new_v4())).await.unwrap();
        let job_id = pending_job(&ledger, workflow.id).await;
        let recorder = Recorder {
            fail_during_publish: Some((ledger.clone(), job_id)),
            ..Recorder::default()
        };

        let outcome = ledger
            .complete_versioned_job(job_id, VersionClaim::Next { floor: 1 }, &recorder)
            .await
            .unwrap();

        assert_eq!(outcome, Transition::AlreadyTerminal(JobStatus::Failed));
        assert_eq!(*recorder.reverted.lock().unwrap(), vec![VersionLabel::FIRST]);
        assert!(ledger.list_versions(workflow.id).await.unwrap().is_empty());
        assert_eq!(ledger.load_workflow(workflow.id).await.unwrap().version_counter, 0);
    }

    #[tokio::test]
    async fn test_completion_records_version_row() {
        let ledger = MemoryLedger::new();
        let user = Uuid::new_v4();
        let workflow = ledger.create_workflow(new_workflow(user)).await.unwrap();
        let job_id = pending_job(&ledger, workflow.id).await;
        ledger
            .complete_versioned_job(job_id, VersionClaim::Exact(1), &Recorder::default())
            .await
            .unwrap();

        let detail = ledger.workflow_detail(workflow.id, user).await.unwrap();
        assert_eq!(detail.jobs.len(), 1);
        assert_eq!(detail.versions.len(), 1);
        assert_eq!(detail.versions[0].label, "v1");
        assert_eq!(detail.versions[0].job_id, Some(job_id));
    }
}
