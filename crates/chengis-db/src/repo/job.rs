//! Job repository.

use chengis_core::ResourceId;
use chengis_core::pipeline::Pipeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::{Cursor, Page, page_from_rows};
use crate::{DbError, DbResult, RoutedDatasource};

/// A job row: a named, versioned pipeline belonging to an org.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: uuid::Uuid,
    pub org_id: uuid::Uuid,
    pub name: String,
    pub pipeline: serde_json::Value,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn pipeline(&self) -> DbResult<Pipeline> {
        serde_json::from_value(self.pipeline.clone())
            .map_err(|e| DbError::Corrupt(format!("job {} pipeline: {e}", self.id)))
    }
}

pub struct JobRepo {
    db: RoutedDatasource,
}

impl JobRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        org_id: ResourceId,
        name: &str,
        pipeline: &Pipeline,
    ) -> DbResult<JobRecord> {
        let config = serde_json::to_value(pipeline)
            .map_err(|e| DbError::Corrupt(format!("serialise pipeline: {e}")))?;
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (id, org_id, name, pipeline, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(org_id.as_uuid())
        .bind(name)
        .bind(config)
        .fetch_one(self.db.write())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("job {name}"))
            }
            _ => DbError::Database(e),
        })?;
        Ok(record)
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<JobRecord> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.db.read())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    pub async fn get_by_name(&self, org_id: ResourceId, name: &str) -> DbResult<JobRecord> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE org_id = $1 AND name = $2")
            .bind(org_id.as_uuid())
            .bind(name)
            .fetch_optional(self.db.read())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {name}")))
    }

    /// Cursor-paginated listing, newest first.
    pub async fn list(
        &self,
        org_id: ResourceId,
        cursor: Option<&str>,
        limit: usize,
    ) -> DbResult<Page<JobRecord>> {
        let rows = match cursor {
            Some(token) => {
                let cursor = Cursor::decode(token)?;
                let boundary_id: uuid::Uuid = cursor
                    .id
                    .parse()
                    .map_err(|_| DbError::BadCursor("bad id".into()))?;
                sqlx::query_as::<_, JobRecord>(
                    r#"
                    SELECT * FROM jobs
                    WHERE org_id = $1
                      AND (created_at < $2 OR (created_at = $2 AND id < $3))
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                )
                .bind(org_id.as_uuid())
                .bind(cursor.ts)
                .bind(boundary_id)
                .bind((limit + 1) as i64)
                .fetch_all(self.db.read())
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRecord>(
                    r#"
                    SELECT * FROM jobs
                    WHERE org_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(org_id.as_uuid())
                .bind((limit + 1) as i64)
                .fetch_all(self.db.read())
                .await?
            }
        };
        Ok(page_from_rows(rows, limit, |row| {
            (row.created_at, row.id.to_string())
        }))
    }

    pub async fn update_pipeline(&self, id: ResourceId, pipeline: &Pipeline) -> DbResult<JobRecord> {
        let config = serde_json::to_value(pipeline)
            .map_err(|e| DbError::Corrupt(format!("serialise pipeline: {e}")))?;
        sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs SET pipeline = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(config)
        .fetch_optional(self.db.write())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("job {id}")))
    }

    pub async fn delete(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.db.write())
            .await?;
        Ok(())
    }

    /// Every job across orgs, for startup re-synchronisation.
    pub async fn list_all(&self) -> DbResult<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs ORDER BY created_at")
            .fetch_all(self.db.read())
            .await?;
        Ok(rows)
    }

    /// Jobs whose pipeline declares a source repository, for webhook
    /// matching.
    pub async fn with_source(&self) -> DbResult<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE pipeline->'source'->>'url' IS NOT NULL",
        )
        .fetch_all(self.db.read())
        .await?;
        Ok(rows)
    }

    /// Jobs that should be triggered when `job_id` completes
    /// successfully.
    pub async fn dependents(&self, job_id: ResourceId) -> DbResult<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT j.* FROM jobs j
            JOIN job_dependencies d ON d.job_id = j.id
            WHERE d.depends_on_job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(self.db.read())
        .await?;
        Ok(rows)
    }

    pub async fn add_dependency(
        &self,
        job_id: ResourceId,
        depends_on: ResourceId,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_dependencies (id, job_id, depends_on_job_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(job_id.as_uuid())
        .bind(depends_on.as_uuid())
        .execute(self.db.write())
        .await?;
        Ok(())
    }
}
