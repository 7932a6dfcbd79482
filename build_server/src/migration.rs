//! Idempotent schema migration, run once at startup.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

/// SQL migration for the build engine tables.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS builds (
    build_id        VARCHAR(64) PRIMARY KEY,
    deployment_id   VARCHAR(64) NOT NULL,
    project_id      VARCHAR(64) NOT NULL,
    status          VARCHAR(16) NOT NULL DEFAULT 'pending',
    rebuild_from    VARCHAR(64),
    request         JSONB NOT NULL,
    stages          JSONB NOT NULL DEFAULT '[]',
    cache           JSONB NOT NULL DEFAULT '{}',
    artifacts       JSONB NOT NULL DEFAULT '[]',
    error           JSONB,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 3,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at      TIMESTAMPTZ,
    completed_at    TIMESTAMPTZ,
    duration_ms     BIGINT
);

CREATE INDEX IF NOT EXISTS idx_builds_deployment ON builds (deployment_id);
CREATE INDEX IF NOT EXISTS idx_builds_project_created ON builds (project_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_builds_status ON builds (status);
CREATE INDEX IF NOT EXISTS idx_builds_completed ON builds (completed_at);

CREATE TABLE IF NOT EXISTS build_jobs (
    id              BIGSERIAL PRIMARY KEY,
    build_id        VARCHAR(64) NOT NULL UNIQUE REFERENCES builds(build_id) ON DELETE CASCADE,
    payload         JSONB NOT NULL,
    state           VARCHAR(16) NOT NULL DEFAULT 'waiting',
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL DEFAULT 4,
    progress        INTEGER NOT NULL DEFAULT 0,
    run_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    claimed_by      VARCHAR(128),
    heartbeat_at    TIMESTAMPTZ,
    last_error      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

ALTER TABLE build_jobs ADD COLUMN IF NOT EXISTS heartbeat_at TIMESTAMPTZ;

CREATE INDEX IF NOT EXISTS idx_build_jobs_claim ON build_jobs (state, run_at, id);

CREATE TABLE IF NOT EXISTS deployments (
    deployment_id     VARCHAR(64) PRIMARY KEY,
    project_id        VARCHAR(64) NOT NULL,
    status            VARCHAR(16) NOT NULL DEFAULT 'queued',
    build_id          VARCHAR(64),
    error_message     TEXT,
    artifact_path     VARCHAR(1024),
    build_started_at  TIMESTAMPTZ,
    build_finished_at TIMESTAMPTZ,
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Run the build engine migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("build engine migration failed: {e}"))?;
    Ok(())
}
