//! Policy storage. Rules are stored as their typed JSON encoding and
//! surfaced in evaluation order: ascending priority, creation order as
//! the tie-break.

use chengis_core::ResourceId;
use chengis_core::policy::PolicyRule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PolicyRecord {
    pub id: uuid::Uuid,
    pub org_id: uuid::Uuid,
    pub kind: String,
    pub priority: i32,
    pub rule: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PolicyRecord {
    pub fn rule(&self) -> DbResult<PolicyRule> {
        serde_json::from_value(self.rule.clone())
            .map_err(|e| DbError::Corrupt(format!("policy {}: {e}", self.id)))
    }
}

pub struct PolicyRepo {
    db: RoutedDatasource,
}

impl PolicyRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        org_id: ResourceId,
        priority: i32,
        rule: &PolicyRule,
    ) -> DbResult<PolicyRecord> {
        let kind = match rule {
            PolicyRule::BranchRestriction { .. } => "branch-restriction",
            PolicyRule::TimeWindow { .. } => "time-window",
            PolicyRule::DockerImage { .. } => "docker-image",
            PolicyRule::PluginTrust { .. } => "plugin-trust",
        };
        let value = serde_json::to_value(rule).map_err(|e| DbError::Corrupt(e.to_string()))?;
        let record = sqlx::query_as::<_, PolicyRecord>(
            r#"
            INSERT INTO policies (id, org_id, kind, priority, rule, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(org_id.as_uuid())
        .bind(kind)
        .bind(priority)
        .bind(value)
        .fetch_one(self.db.write())
        .await?;
        Ok(record)
    }

    /// Policies for an org in evaluation order.
    pub async fn list_for_org(&self, org_id: ResourceId) -> DbResult<Vec<PolicyRecord>> {
        let records = sqlx::query_as::<_, PolicyRecord>(
            r#"
            SELECT * FROM policies
            WHERE org_id = $1
            ORDER BY priority ASC, created_at ASC
            "#,
        )
        .bind(org_id.as_uuid())
        .fetch_all(self.db.read())
        .await?;
        Ok(records)
    }

    pub async fn delete(&self, id: ResourceId) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM policies WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.db.write())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("policy {id}")));
        }
        Ok(())
    }
}
