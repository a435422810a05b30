use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use super::{resolve_claim, to_db_int, Ledger, LedgerError, VersionPublisher};
use crate::models::workflow::{
    JobKind, JobRow, JobStatus, NewWorkflow, Pagination, Transition, VersionClaim, VersionLabel,
    VersionRow, WorkflowRow,
};

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Status of a job that a guarded UPDATE did not touch.
    async fn terminal_status(&self, id: Uuid) -> Result<Transition, LedgerError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let status = status.ok_or_else(|| LedgerError::NotFound(format!("Job {id}")))?;
        let status = status.parse().unwrap_or(JobStatus::Pending);
        warn!(
            "Job {id} is already {}; ignoring duplicate terminal write",
            status.as_str()
        );
        Ok(Transition::AlreadyTerminal(status))
    }

    /// Locks the workflow row, assigns the claimed number, publishes, then
    /// writes the counter, the version row and (for a job) its SUCCESS state
    /// before committing. A failed write reverts the publish.
    async fn publish_locked(
        &self,
        mut tx: Transaction<'static, Postgres>,
        workflow_id: Uuid,
        job_id: Option<Uuid>,
        claim: VersionClaim,
        publisher: &dyn VersionPublisher,
    ) -> Result<VersionLabel, LedgerError> {
        let counter: Option<i32> = sqlx::query_scalar(
            "SELECT version_counter FROM workflows WHERE id = $1 FOR UPDATE",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await?;
        let counter = counter.ok_or_else(|| LedgerError::NotFound(format!("Workflow {workflow_id}")))?;
        let version = resolve_claim(workflow_id, claim, counter)?;

        let payload = publisher.publish(version).await?;
        let written = write_version(tx, workflow_id, job_id, version, &payload).await;
        if let Err(e) = written {
            publisher.revert(version).await;
            return Err(e);
        }

        info!("Recorded version {version} of workflow {workflow_id}");
        Ok(version)
    }
}

async fn write_version(
    mut tx: Transaction<'static, Postgres>,
    workflow_id: Uuid,
    job_id: Option<Uuid>,
    version: VersionLabel,
    payload: &Value,
) -> Result<(), LedgerError> {
    sqlx::query("UPDATE workflows SET version_counter = $2 WHERE id = $1")
        .bind(workflow_id)
        .bind(to_db_int(version.number()))
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "INSERT INTO workflow_versions (workflow_id, version, label, job_id) VALUES ($1, $2, $3, $4)",
    )
    .bind(workflow_id)
    .bind(to_db_int(version.number()))
    .bind(version.to_string())
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    if let Some(job_id) = job_id {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'SUCCESS', result_data = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(payload)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[async_trait]
impl Ledger for PgLedger {
    async fn create_workflow(&self, new: NewWorkflow) -> Result<WorkflowRow, LedgerError> {
        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows
                (id, user_id, workspace_id, job_description, template_filename, profile_filename)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(&new.workspace_id)
        .bind(&new.job_description)
        .bind(&new.template_filename)
        .bind(&new.profile_filename)
        .fetch_one(&self.pool)
        .await?;

        info!("Created workflow {} for user {}", row.id, row.user_id);
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid, user_id: Uuid) -> Result<WorkflowRow, LedgerError> {
        sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Workflow {id}")))
    }

    async fn load_workflow(&self, id: Uuid) -> Result<WorkflowRow, LedgerError> {
        sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("Workflow {id}")))
    }

    async fn list_workflows(
        &self,
        user_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<WorkflowRow>, LedgerError> {
        let page = page.clamped();
        Ok(sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT * FROM workflows
            WHERE user_id = $1
            ORDER BY created_at DESC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(page.skip)
        .bind(page.limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_jobs(&self, workflow_id: Uuid) -> Result<Vec<JobRow>, LedgerError> {
        Ok(sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE workflow_id = $1 ORDER BY created_at ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<VersionRow>, LedgerError> {
        Ok(sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM workflow_versions WHERE workflow_id = $1 ORDER BY version ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_job(
        &self,
        id: Uuid,
        workflow_id: Uuid,
        kind: JobKind,
    ) -> Result<JobRow, LedgerError> {
        Ok(sqlx::query_as::<_, JobRow>(
            "INSERT INTO jobs (id, workflow_id, kind) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(id)
        .bind(workflow_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_job(&self, id: Uuid, user_id: Uuid) -> Result<JobRow, LedgerError> {
        sqlx::query_as::<_, JobRow>(
            r#"
            SELECT j.* FROM jobs j
            JOIN workflows w ON w.id = j.workflow_id
            WHERE j.id = $1 AND w.user_id = $2
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("Job {id}")))
    }

    async fn complete_job(&self, id: Uuid, payload: Value) -> Result<Transition, LedgerError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'SUCCESS', result_data = $2, updated_at = now()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return self.terminal_status(id).await;
        }
        Ok(Transition::Applied)
    }

    async fn complete_versioned_job(
        &self,
        id: Uuid,
        claim: VersionClaim,
        publisher: &dyn VersionPublisher,
    ) -> Result<Transition, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Job row first, then workflow row; fail_job only ever takes the job row.
        let job: Option<(Uuid, String)> =
            sqlx::query_as("SELECT workflow_id, status FROM jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let (workflow_id, status) = job.ok_or_else(|| LedgerError::NotFound(format!("Job {id}")))?;
        if status != JobStatus::Pending.as_str() {
            tx.rollback().await?;
            return self.terminal_status(id).await;
        }

        self.publish_locked(tx, workflow_id, Some(id), claim, publisher)
            .await?;
        Ok(Transition::Applied)
    }

    async fn fail_job(&self, id: Uuid, error: &str) -> Result<Transition, LedgerError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED', error_message = $2, updated_at = now()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return self.terminal_status(id).await;
        }
        Ok(Transition::Applied)
    }

    async fn publish_version(
        &self,
        workflow_id: Uuid,
        claim: VersionClaim,
        publisher: &dyn VersionPublisher,
    ) -> Result<VersionLabel, LedgerError> {
        let tx = self.pool.begin().await?;
        self.publish_locked(tx, workflow_id, None, claim, publisher)
            .await
    }
}
