//! Artifact metadata repository.

use chengis_core::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArtifactRecord {
    pub id: uuid::Uuid,
    pub build_id: uuid::Uuid,
    pub filename: String,
    /// Location in artifact storage.
    pub path: String,
    pub size: i64,
    pub content_type: Option<String>,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct ArtifactRepo {
    db: RoutedDatasource,
}

impl ArtifactRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    pub async fn insert(
        &self,
        build_id: ResourceId,
        filename: &str,
        path: &str,
        size: i64,
        content_type: Option<&str>,
        sha256: Option<&str>,
    ) -> DbResult<ArtifactRecord> {
        let record = sqlx::query_as::<_, ArtifactRecord>(
            r#"
            INSERT INTO artifacts (id, build_id, filename, path, size, content_type, sha256, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (build_id, filename) DO UPDATE
                SET path = EXCLUDED.path, size = EXCLUDED.size, sha256 = EXCLUDED.sha256
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(build_id.as_uuid())
        .bind(filename)
        .bind(path)
        .bind(size)
        .bind(content_type)
        .bind(sha256)
        .fetch_one(self.db.write())
        .await?;
        Ok(record)
    }

    pub async fn list_for_build(&self, build_id: ResourceId) -> DbResult<Vec<ArtifactRecord>> {
        let records = sqlx::query_as::<_, ArtifactRecord>(
            "SELECT * FROM artifacts WHERE build_id = $1 ORDER BY filename",
        )
        .bind(build_id.as_uuid())
        .fetch_all(self.db.read())
        .await?;
        Ok(records)
    }

    pub async fn get(&self, build_id: ResourceId, filename: &str) -> DbResult<ArtifactRecord> {
        sqlx::query_as::<_, ArtifactRecord>(
            "SELECT * FROM artifacts WHERE build_id = $1 AND filename = $2",
        )
        .bind(build_id.as_uuid())
        .bind(filename)
        .fetch_optional(self.db.read())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("artifact {filename} of build {build_id}")))
    }
}
