//! PostgreSQL backend (diesel-async over a deadpool pool).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::error::{BuildError, Result};
use crate::models::build::BuildRow;
use crate::models::deployment::DeploymentRow;
use crate::models::job::{JobRow, NewJobRow};
use crate::models::{Build, BuildRequest, BuildStatus, Deployment, Enqueued, Job, JobState};
use crate::schema::{build_jobs, builds, deployments};

use super::{BuildStore, DeploymentStore, JobQueue};

pub type PgPool = Pool<AsyncPgConnection>;

/// Claim the oldest runnable job. `SKIP LOCKED` keeps concurrent claimers,
/// in this process or another, from ever receiving the same row.
const CLAIM_SQL: &str = r#"
UPDATE build_jobs
SET state = 'active',
    attempts = attempts + 1,
    claimed_by = $1,
    heartbeat_at = NOW(),
    updated_at = NOW()
WHERE id = (
    SELECT id FROM build_jobs
    WHERE state = 'waiting' AND run_at <= NOW()
    ORDER BY run_at, id
    FOR UPDATE SKIP LOCKED
    LIMIT 1
)
RETURNING *
"#;

const POSITION_SQL: &str = r#"
SELECT COUNT(*) AS position
FROM build_jobs w, build_jobs j
WHERE j.build_id = $1
  AND j.state = 'waiting'
  AND w.state = 'waiting'
  AND (w.run_at, w.id) <= (j.run_at, j.id)
"#;

#[derive(QueryableByName)]
struct PositionRow {
    #[diesel(sql_type = BigInt)]
    position: i64,
}

fn terminal_statuses() -> Vec<&'static str> {
    BuildStatus::TERMINAL.iter().map(|s| s.as_str()).collect()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect(database_url: &str, max_connections: usize) -> Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(BuildError::store)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| BuildError::Store(format!("diesel pool: {e}")))
    }

    async fn position_of(&self, build_id: &str) -> Result<Option<usize>> {
        let mut conn = self.conn().await?;
        let row: PositionRow = diesel::sql_query(POSITION_SQL)
            .bind::<Text, _>(build_id)
            .get_result(&mut conn)
            .await
            .map_err(BuildError::store)?;
        Ok((row.position > 0).then_some(row.position as usize))
    }
}

#[async_trait]
impl BuildStore for PgStore {
    async fn insert(&self, build: &Build) -> Result<()> {
        let row = BuildRow::try_from(build)?;
        let mut conn = self.conn().await?;
        diesel::insert_into(builds::table)
            .values(&row)
            .execute(&mut conn)
            .await
            .map_err(BuildError::store)?;
        Ok(())
    }

    async fn get(&self, build_id: &str) -> Result<Option<Build>> {
        let mut conn = self.conn().await?;
        let row = builds::table
            .find(build_id)
            .select(BuildRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(BuildError::store)?;
        row.map(Build::try_from).transpose()
    }

    async fn save(&self, build: &Build) -> Result<()> {
        let row = BuildRow::try_from(build)?;
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            builds::table
                .filter(builds::build_id.eq(&build.build_id))
                .filter(builds::status.ne_all(terminal_statuses())),
        )
        .set(&row)
        .execute(&mut conn)
        .await
        .map_err(BuildError::store)?;

        if updated > 0 {
            return Ok(());
        }
        let exists: i64 = builds::table
            .filter(builds::build_id.eq(&build.build_id))
            .count()
            .get_result(&mut conn)
            .await
            .map_err(BuildError::store)?;
        if exists > 0 {
            Err(BuildError::AlreadyTerminal(build.build_id.clone()))
        } else {
            Err(BuildError::NotFound(build.build_id.clone()))
        }
    }

    async fn list_for_project(&self, project_id: &str, limit: usize) -> Result<Vec<Build>> {
        let mut conn = self.conn().await?;
        let rows = builds::table
            .filter(builds::project_id.eq(project_id))
            .order((builds::created_at.desc(), builds::build_id.desc()))
            .limit(limit as i64)
            .select(BuildRow::as_select())
            .load(&mut conn)
            .await
            .map_err(BuildError::store)?;
        rows.into_iter().map(Build::try_from).collect()
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<Build>> {
        let mut conn = self.conn().await?;
        let rows = builds::table
            .filter(builds::status.eq_any(terminal_statuses()))
            .filter(builds::completed_at.le(cutoff))
            .order(builds::completed_at.asc())
            .select(BuildRow::as_select())
            .load(&mut conn)
            .await
            .map_err(BuildError::store)?;
        rows.into_iter().map(Build::try_from).collect()
    }

    async fn delete(&self, build_id: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(builds::table.find(build_id))
            .execute(&mut conn)
            .await
            .map_err(BuildError::store)?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn push(
        &self,
        build_id: &str,
        request: &BuildRequest,
        max_attempts: u32,
    ) -> Result<Enqueued> {
        let row = NewJobRow {
            build_id: build_id.to_string(),
            payload: serde_json::to_value(request)?,
            state: JobState::Waiting.as_str().to_string(),
            attempts: 0,
            max_attempts: max_attempts as i32,
            progress: 0,
            run_at: Utc::now(),
        };
        let job_id: i64 = {
            let mut conn = self.conn().await?;
            diesel::insert_into(build_jobs::table)
                .values(&row)
                .returning(build_jobs::id)
                .get_result(&mut conn)
                .await
                .map_err(BuildError::store)?
        };
        let position = self.position_of(build_id).await?.unwrap_or(1);
        Ok(Enqueued { job_id, position })
    }

    async fn claim(&self, worker: &str) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        let row: Option<JobRow> = diesel::sql_query(CLAIM_SQL)
            .bind::<Text, _>(worker)
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(BuildError::store)?;
        row.map(Job::try_from).transpose()
    }

    async fn get(&self, build_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        let row = build_jobs::table
            .filter(build_jobs::build_id.eq(build_id))
            .select(JobRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(BuildError::store)?;
        row.map(Job::try_from).transpose()
    }

    async fn position(&self, build_id: &str) -> Result<Option<usize>> {
        self.position_of(build_id).await
    }

    async fn set_progress(&self, build_id: &str, progress: u8) -> Result<()> {
        let progress = i32::from(progress.min(100));
        let mut conn = self.conn().await?;
        diesel::update(
            build_jobs::table
                .filter(build_jobs::build_id.eq(build_id))
                .filter(build_jobs::progress.lt(progress)),
        )
        .set((
            build_jobs::progress.eq(progress),
            build_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(BuildError::store)?;
        Ok(())
    }

    async fn retry_at(&self, build_id: &str, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(
            build_jobs::table
                .filter(build_jobs::build_id.eq(build_id))
                .filter(build_jobs::state.eq(JobState::Active.as_str())),
        )
        .set((
            build_jobs::state.eq(JobState::Waiting.as_str()),
            build_jobs::run_at.eq(run_at),
            build_jobs::claimed_by.eq(None::<String>),
            build_jobs::last_error.eq(Some(error)),
            build_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(BuildError::store)?;
        Ok(())
    }

    async fn complete(&self, build_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(build_jobs::table.filter(build_jobs::build_id.eq(build_id)))
            .set((
                build_jobs::state.eq(JobState::Completed.as_str()),
                build_jobs::progress.eq(100),
                build_jobs::claimed_by.eq(None::<String>),
                build_jobs::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await
            .map_err(BuildError::store)?;
        Ok(())
    }

    async fn fail(&self, build_id: &str, error: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(build_jobs::table.filter(build_jobs::build_id.eq(build_id)))
            .set((
                build_jobs::state.eq(JobState::Failed.as_str()),
                build_jobs::claimed_by.eq(None::<String>),
                build_jobs::last_error.eq(Some(error)),
                build_jobs::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await
            .map_err(BuildError::store)?;
        Ok(())
    }

    async fn cancel_waiting(&self, build_id: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            build_jobs::table
                .filter(build_jobs::build_id.eq(build_id))
                .filter(build_jobs::state.eq(JobState::Waiting.as_str())),
        )
        .set((
            build_jobs::state.eq(JobState::Cancelled.as_str()),
            build_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(BuildError::store)?;
        Ok(updated > 0)
    }

    async fn mark_cancelled(&self, build_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::update(
            build_jobs::table
                .filter(build_jobs::build_id.eq(build_id))
                .filter(
                    build_jobs::state
                        .eq_any([JobState::Waiting.as_str(), JobState::Active.as_str()]),
                ),
        )
        .set((
            build_jobs::state.eq(JobState::Cancelled.as_str()),
            build_jobs::claimed_by.eq(None::<String>),
            build_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(BuildError::store)?;
        Ok(())
    }

    async fn heartbeat(&self, build_id: &str, worker: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let updated = diesel::update(
            build_jobs::table
                .filter(build_jobs::build_id.eq(build_id))
                .filter(build_jobs::state.eq(JobState::Active.as_str()))
                .filter(build_jobs::claimed_by.eq(worker)),
        )
        .set((
            build_jobs::heartbeat_at.eq(Some(now)),
            build_jobs::updated_at.eq(now),
        ))
        .execute(&mut conn)
        .await
        .map_err(BuildError::store)?;
        Ok(updated > 0)
    }

    async fn requeue_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            build_jobs::table
                .filter(build_jobs::state.eq(JobState::Active.as_str()))
                .filter(
                    build_jobs::heartbeat_at
                        .is_null()
                        .or(build_jobs::heartbeat_at.lt(cutoff)),
                ),
        )
        .set((
            build_jobs::state.eq(JobState::Waiting.as_str()),
            build_jobs::claimed_by.eq(None::<String>),
            build_jobs::heartbeat_at.eq(None::<DateTime<Utc>>),
            build_jobs::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(BuildError::store)?;
        Ok(updated as u64)
    }

    async fn depth(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let count: i64 = build_jobs::table
            .filter(build_jobs::state.eq(JobState::Waiting.as_str()))
            .count()
            .get_result(&mut conn)
            .await
            .map_err(BuildError::store)?;
        Ok(count.max(0) as u64)
    }

    async fn delete(&self, build_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::delete(build_jobs::table.filter(build_jobs::build_id.eq(build_id)))
            .execute(&mut conn)
            .await
            .map_err(BuildError::store)?;
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for PgStore {
    async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        let mut conn = self.conn().await?;
        let row = deployments::table
            .find(deployment_id)
            .select(DeploymentRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(BuildError::store)?;
        row.map(Deployment::try_from).transpose()
    }

    async fn upsert(&self, deployment: &Deployment) -> Result<()> {
        let row = DeploymentRow::from(deployment);
        let mut conn = self.conn().await?;
        diesel::insert_into(deployments::table)
            .values(&row)
            .on_conflict(deployments::deployment_id)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .await
            .map_err(BuildError::store)?;
        Ok(())
    }
}
