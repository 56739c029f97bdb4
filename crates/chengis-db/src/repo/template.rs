//! Pipeline template storage.

use chengis_core::ResourceId;
use chengis_core::pipeline::Pipeline;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{DbError, DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
struct TemplateRecord {
    id: uuid::Uuid,
    org_id: uuid::Uuid,
    name: String,
    pipeline: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct TemplateRepo {
    db: RoutedDatasource,
}

impl TemplateRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    pub async fn upsert(
        &self,
        org_id: ResourceId,
        name: &str,
        pipeline: &Pipeline,
    ) -> DbResult<()> {
        let value = serde_json::to_value(pipeline)
            .map_err(|e| DbError::Corrupt(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO templates (id, org_id, name, pipeline, created_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW(), NOW())
            ON CONFLICT (org_id, name) DO UPDATE
                SET pipeline = EXCLUDED.pipeline, updated_at = NOW()
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(org_id.as_uuid())
        .bind(name)
        .bind(value)
        .execute(self.db.write())
        .await?;
        Ok(())
    }

    pub async fn get(&self, org_id: ResourceId, name: &str) -> DbResult<Pipeline> {
        let record = sqlx::query_as::<_, TemplateRecord>(
            "SELECT * FROM templates WHERE org_id = $1 AND name = $2",
        )
        .bind(org_id.as_uuid())
        .bind(name)
        .fetch_optional(self.db.read())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("template {name}")))?;
        serde_json::from_value(record.pipeline)
            .map_err(|e| DbError::Corrupt(format!("template {name}: {e}")))
    }

    /// All of an org's templates keyed by name, for `extends` resolution.
    pub async fn load_all(&self, org_id: ResourceId) -> DbResult<HashMap<String, Pipeline>> {
        let records = sqlx::query_as::<_, TemplateRecord>(
            "SELECT * FROM templates WHERE org_id = $1",
        )
        .bind(org_id.as_uuid())
        .fetch_all(self.db.read())
        .await?;
        let mut templates = HashMap::with_capacity(records.len());
        for record in records {
            let pipeline: Pipeline = serde_json::from_value(record.pipeline)
                .map_err(|e| DbError::Corrupt(format!("template {}: {e}", record.name)))?;
            templates.insert(record.name, pipeline);
        }
        Ok(templates)
    }

    pub async fn delete(&self, org_id: ResourceId, name: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM templates WHERE org_id = $1 AND name = $2")
            .bind(org_id.as_uuid())
            .bind(name)
            .execute(self.db.write())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("template {name}")));
        }
        Ok(())
    }
}
