use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Idempotent schema, applied in order at startup.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        id                UUID PRIMARY KEY,
        user_id           UUID NOT NULL,
        workspace_id      TEXT NOT NULL,
        job_description   TEXT NOT NULL,
        template_filename TEXT NOT NULL,
        profile_filename  TEXT,
        version_counter   INTEGER NOT NULL DEFAULT 0 CHECK (version_counter >= 0),
        created_at        TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS workflows_user_created_idx ON workflows (user_id, created_at DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id            UUID PRIMARY KEY,
        workflow_id   UUID NOT NULL REFERENCES workflows (id) ON DELETE CASCADE,
        kind          TEXT NOT NULL,
        status        TEXT NOT NULL DEFAULT 'PENDING'
                      CHECK (status IN ('PENDING', 'SUCCESS', 'FAILED')),
        result_data   JSONB,
        error_message TEXT,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_workflow_idx ON jobs (workflow_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_versions (
        workflow_id UUID NOT NULL REFERENCES workflows (id) ON DELETE CASCADE,
        version     INTEGER NOT NULL CHECK (version > 0),
        label       TEXT NOT NULL,
        job_id      UUID REFERENCES jobs (id) ON DELETE SET NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        PRIMARY KEY (workflow_id, version)
    )
    "#,
    // Versions are numbered inside the completion transaction, so their
    // timestamps must be taken at insert time rather than transaction start.
    "ALTER TABLE workflow_versions ALTER COLUMN created_at SET DEFAULT clock_timestamp()",
];

/// Creates and returns a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Schema statement failed: {}", statement.trim()))?;
    }
    info!("Database schema is up to date");
    Ok(())
}
