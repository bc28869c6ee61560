//! PostgreSQL deployment store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::config::DatabaseConfig;
use crate::error::{is_unique_violation, ControlError, ControlResult};
use crate::state::allowed_sources;
use crate::types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, Project, ProjectId, TransitionOutcome,
    User, UserId,
};

use super::{DeploymentFilter, DeploymentStore};

/// Partial unique index enforcing one in-flight deployment per project.
const IN_FLIGHT_INDEX: &str = "uq_deployments_in_flight";

const DEPLOYMENT_COLUMNS: &str = "id, project_id, status, error, created_at, updated_at";

const PROJECT_COLUMNS: &str =
    "id, name, repo_url, slug, default_branch, owner_id, created_at";

/// PostgreSQL-backed deployment store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create a new store.
    ///
    /// The required tables are created if they don't exist.
    pub async fn new(url: &str) -> ControlResult<Self> {
        let config = DatabaseConfig::default();
        Self::from_pool(config.connect(Some(url)).await?).await
    }

    /// Create a store from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> ControlResult<Self> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Ensure the required tables exist.
    async fn ensure_schema(&self) -> ControlResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                repo_url TEXT NOT NULL,
                slug TEXT NOT NULL,
                default_branch TEXT NOT NULL DEFAULT 'main',
                owner_id TEXT REFERENCES users(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                CONSTRAINT uq_projects_name UNIQUE (name),
                CONSTRAINT uq_projects_slug UNIQUE (slug)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                status TEXT NOT NULL CHECK (
                    status IN ('NOT_STARTED', 'QUEUED', 'IN_PROGRESS', 'READY', 'FAILED')
                ),
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS {IN_FLIGHT_INDEX}
            ON deployments (project_id)
            WHERE status IN ('QUEUED', 'IN_PROGRESS')
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_project_created
            ON deployments (project_id, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deployments_in_flight_created
            ON deployments (created_at)
            WHERE status IN ('QUEUED', 'IN_PROGRESS')
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_project(row: &sqlx::postgres::PgRow) -> Project {
        let owner_id: Option<String> = row.get("owner_id");
        Project {
            id: ProjectId::new(row.get::<String, _>("id")),
            name: row.get("name"),
            repo_url: row.get("repo_url"),
            slug: row.get("slug"),
            default_branch: row.get("default_branch"),
            owner_id: owner_id.map(UserId::new),
            created_at: row.get("created_at"),
        }
    }

    /// Parse a row into a DeploymentRecord.
    fn row_to_record(row: &sqlx::postgres::PgRow) -> ControlResult<DeploymentRecord> {
        let status_str: String = row.get("status");
        let status: DeploymentStatus = status_str.parse().map_err(|e| {
            ControlError::Serialisation(format!("failed to parse status '{status_str}': {e}"))
        })?;

        Ok(DeploymentRecord {
            id: DeploymentId::new(row.get::<String, _>("id")),
            project_id: ProjectId::new(row.get::<String, _>("project_id")),
            status,
            error: row.get("error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn map_in_flight(err: sqlx::Error, project_id: &ProjectId) -> ControlError {
        if is_unique_violation(&err) && constraint_of(&err) == Some(IN_FLIGHT_INDEX) {
            return ControlError::DeploymentInFlight {
                project: project_id.to_string(),
            };
        }
        ControlError::Database(err)
    }
}

fn constraint_of(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db) => db.constraint(),
        _ => None,
    }
}

fn status_strings(statuses: &[DeploymentStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_owned()).collect()
}

#[async_trait]
impl DeploymentStore for PostgresStore {
    async fn ping(&self) -> ControlResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_user(&self, email: &str) -> ControlResult<User> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, email) VALUES ($1, $2)
            ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
            RETURNING id, email
            "#,
        )
        .bind(UserId::generate().as_str())
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(User {
            id: UserId::new(row.get::<String, _>("id")),
            email: row.get("email"),
        })
    }

    async fn insert_project(&self, project: &Project) -> ControlResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO projects (id, name, repo_url, slug, default_branch, owner_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(project.id.as_str())
        .bind(&project.name)
        .bind(&project.repo_url)
        .bind(&project.slug)
        .bind(&project.default_branch)
        .bind(project.owner_id.as_ref().map(UserId::as_str))
        .bind(project.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => match constraint_of(&e) {
                Some("uq_projects_slug") => Err(ControlError::SlugTaken(project.slug.clone())),
                _ => Err(ControlError::ProjectExists(project.name.clone())),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn get_project(&self, id: &ProjectId) -> ControlResult<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_project))
    }

    async fn get_project_by_name(&self, name: &str) -> ControlResult<Option<Project>> {
        let row = sqlx::query(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE name = $1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_to_project))
    }

    async fn list_projects(&self, owner: Option<&UserId>) -> ControlResult<Vec<Project>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROJECT_COLUMNS} FROM projects
            WHERE $1::TEXT IS NULL OR owner_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(owner.map(UserId::as_str))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_project).collect())
    }

    async fn claim_project(&self, id: &ProjectId, owner: &UserId) -> ControlResult<Project> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE projects
            SET owner_id = COALESCE(owner_id, $2)
            WHERE id = $1
            RETURNING {PROJECT_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ControlError::ProjectNotFound(id.to_string()))?;

        Ok(Self::row_to_project(&row))
    }

    async fn create_deployment(&self, record: &DeploymentRecord) -> ControlResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deployments (id, project_id, status, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.project_id.as_str())
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_in_flight(e, &record.project_id))?;

        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::row_to_record(&r)?)),
            None => Ok(None),
        }
    }

    async fn list_deployments(
        &self,
        filter: &DeploymentFilter,
    ) -> ControlResult<Vec<DeploymentRecord>> {
        let mut query = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE 1=1");

        let mut params: Vec<String> = Vec::new();

        if let Some(ref project_id) = filter.project_id {
            params.push(project_id.as_str().to_owned());
            query.push_str(&format!(" AND project_id = ${}", params.len()));
        }

        if let Some(status) = filter.status {
            params.push(status.as_str().to_owned());
            query.push_str(&format!(" AND status = ${}", params.len()));
        }

        query.push_str(" ORDER BY created_at DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = filter.offset {
            query.push_str(&format!(" OFFSET {offset}"));
        }

        let mut sqlx_query = sqlx::query(&query);
        for param in &params {
            sqlx_query = sqlx_query.bind(param);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn transition(
        &self,
        id: &DeploymentId,
        to: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<TransitionOutcome> {
        // The CTE captures the pre-update status so one round trip reports
        // both sides of an applied write.
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT status FROM deployments WHERE id = $1 FOR UPDATE
            )
            UPDATE deployments d
            SET status = $2, error = COALESCE($3, d.error), updated_at = NOW()
            FROM prev
            WHERE d.id = $1 AND prev.status = ANY($4)
            RETURNING prev.status AS from_status
            "#,
        )
        .bind(id.as_str())
        .bind(to.as_str())
        .bind(error)
        .bind(status_strings(allowed_sources(to)))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let from: String = row.get("from_status");
            let from = from
                .parse::<DeploymentStatus>()
                .map_err(ControlError::Serialisation)?;
            return Ok(TransitionOutcome::Applied { from, to });
        }

        let current = self
            .get_deployment(id)
            .await?
            .ok_or_else(|| ControlError::DeploymentNotFound(id.to_string()))?;
        Ok(TransitionOutcome::Unchanged {
            current: current.status,
        })
    }

    async fn set_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
    ) -> ControlResult<DeploymentRecord> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE deployments
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {DEPLOYMENT_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some(row)) => Self::row_to_record(&row),
            Ok(None) => Err(ControlError::DeploymentNotFound(id.to_string())),
            Err(e) if is_unique_violation(&e) => {
                let project = self
                    .get_deployment(id)
                    .await?
                    .map(|r| r.project_id.to_string())
                    .unwrap_or_default();
                Err(ControlError::DeploymentInFlight { project })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail_stale(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> ControlResult<Vec<DeploymentId>> {
        let rows = sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'FAILED', error = $2, updated_at = NOW()
            WHERE status = ANY($3) AND created_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(error)
        .bind(status_strings(allowed_sources(DeploymentStatus::Failed)))
        .fetch_all(&self.pool)
        .await?;

        let mut ids: Vec<_> = rows
            .iter()
            .map(|r| DeploymentId::new(r.get::<String, _>("id")))
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn count_by_status(&self) -> ControlResult<Vec<(DeploymentStatus, u64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM deployments GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            let status = status
                .parse::<DeploymentStatus>()
                .map_err(ControlError::Serialisation)?;
            counts.push((status, u64::try_from(n).unwrap_or_default()));
        }
        counts.sort_by_key(|(s, _)| DeploymentStatus::ALL.iter().position(|a| a == s));
        Ok(counts)
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore").finish_non_exhaustive()
    }
}
