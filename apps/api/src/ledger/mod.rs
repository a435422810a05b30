//! Workflow/Job Ledger: the persistent record of optimization sessions,
//! their asynchronous jobs and the versions those jobs produced.
//!
//! INVARIANTS
//! - `complete_job` / `fail_job` are the only writers of a job's terminal
//!   fields and only ever move a job out of PENDING. A second terminal write
//!   is reported as `Transition::AlreadyTerminal` and changes nothing.
//! - Workflow reads on behalf of a user filter by workflow id AND user id.
//!   A foreign workflow is `NotFound`, never a distinct error.
//! - Version numbers are assigned while the workflow row is locked, in the
//!   same transaction that records the version (and completes the job, if
//!   any). Numbers therefore follow completion order and a job that fails
//!   never consumes one.

#[cfg(test)]
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::workflow::{
    JobKind, JobRow, NewWorkflow, Pagination, Transition, VersionClaim, VersionLabel, VersionRow,
    WorkflowDetail, WorkflowRow,
};

pub use postgres::PgLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Version v{requested} is not after the latest claimed version v{current}")]
    VersionConflict { requested: u32, current: u32 },

    #[error("Workflow {0} has an invalid version counter")]
    InvalidCounter(Uuid),

    #[error("Could not publish version: {0}")]
    Publish(String),
}

/// Makes a staged render visible under its assigned number.
///
/// Called by the ledger while it holds the workflow lock. `publish` returns
/// the job payload to store; `revert` undoes it if the write then fails.
#[async_trait]
pub trait VersionPublisher: Send + Sync {
    async fn publish(&self, version: VersionLabel) -> Result<Value, LedgerError>;

    async fn revert(&self, version: VersionLabel);
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowRow, LedgerError>;

    /// Ownership-checked read.
    async fn get_workflow(&self, id: Uuid, user_id: Uuid) -> Result<WorkflowRow, LedgerError>;

    /// Unchecked read for workers; the enqueueing request already checked ownership.
    async fn load_workflow(&self, id: Uuid) -> Result<WorkflowRow, LedgerError>;

    /// Newest first.
    async fn list_workflows(
        &self,
        user_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<WorkflowRow>, LedgerError>;

    async fn list_jobs(&self, workflow_id: Uuid) -> Result<Vec<JobRow>, LedgerError>;

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<VersionRow>, LedgerError>;

    /// Inserts a PENDING job. `id` is the task id used on the queue.
    async fn create_job(
        &self,
        id: Uuid,
        workflow_id: Uuid,
        kind: JobKind,
    ) -> Result<JobRow, LedgerError>;

    /// Ownership-checked through the job's workflow.
    async fn get_job(&self, id: Uuid, user_id: Uuid) -> Result<JobRow, LedgerError>;

    /// PENDING → SUCCESS for a job that produced no version.
    async fn complete_job(&self, id: Uuid, payload: Value) -> Result<Transition, LedgerError>;

    /// PENDING → SUCCESS for a job that produced a version. Under the workflow
    /// lock: resolves `claim`, publishes, advances the counter, records the
    /// version row and stores the published payload, all or nothing.
    async fn complete_versioned_job(
        &self,
        id: Uuid,
        claim: VersionClaim,
        publisher: &dyn VersionPublisher,
    ) -> Result<Transition, LedgerError>;

    /// PENDING → FAILED.
    async fn fail_job(&self, id: Uuid, error: &str) -> Result<Transition, LedgerError>;

    /// Assigns and records a version produced outside a job (manual compile).
    async fn publish_version(
        &self,
        workflow_id: Uuid,
        claim: VersionClaim,
        publisher: &dyn VersionPublisher,
    ) -> Result<VersionLabel, LedgerError>;

    async fn workflow_detail(&self, id: Uuid, user_id: Uuid) -> Result<WorkflowDetail, LedgerError> {
        let workflow = self.get_workflow(id, user_id).await?;
        let jobs = self.list_jobs(id).await?;
        let versions = self.list_versions(id).await?;
        Ok(WorkflowDetail {
            workflow,
            jobs,
            versions,
        })
    }
}

/// The number `claim` yields against the workflow's current counter.
fn resolve_claim(
    workflow_id: Uuid,
    claim: VersionClaim,
    counter: i32,
) -> Result<VersionLabel, LedgerError> {
    let next = match claim {
        VersionClaim::Next { floor } => counter.saturating_add(1).max(to_db_int(floor)),
        VersionClaim::Exact(requested) => {
            if to_db_int(requested) <= counter {
                return Err(LedgerError::VersionConflict {
                    requested,
                    current: u32::try_from(counter).unwrap_or(0),
                });
            }
            to_db_int(requested)
        }
    };
    counter_label(workflow_id, next)
}

/// Converts a stored counter value into a label.
fn counter_label(workflow_id: Uuid, counter: i32) -> Result<VersionLabel, LedgerError> {
    u32::try_from(counter)
        .ok()
        .and_then(VersionLabel::new)
        .ok_or(LedgerError::InvalidCounter(workflow_id))
}

fn to_db_int(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
