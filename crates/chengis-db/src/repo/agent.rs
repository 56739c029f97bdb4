//! Agent table. The dispatcher's in-memory registry is the working copy;
//! this table lets the fleet be rebuilt after a master restart.

use chengis_core::ResourceId;
use chengis_core::agent::{Agent, AgentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{DbError, DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
struct AgentRecord {
    id: uuid::Uuid,
    name: String,
    url: String,
    labels: serde_json::Value,
    max_builds: i32,
    current_builds: i32,
    status: String,
    last_heartbeat: DateTime<Utc>,
    system_info: serde_json::Value,
    org_id: Option<uuid::Uuid>,
}

impl AgentRecord {
    fn into_core(self) -> DbResult<Agent> {
        let status = AgentStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("agent status {}", self.status)))?;
        let labels: BTreeSet<String> = serde_json::from_value(self.labels).unwrap_or_default();
        Ok(Agent {
            id: self.id.into(),
            name: self.name,
            url: self.url,
            labels,
            max_builds: self.max_builds.max(0) as u32,
            current_builds: self.current_builds.max(0) as u32,
            status,
            last_heartbeat: self.last_heartbeat,
            system_info: self.system_info,
            org_id: self.org_id.map(Into::into),
        })
    }
}

pub struct AgentRepo {
    db: RoutedDatasource,
}

impl AgentRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    /// Register or re-register an agent by name.
    pub async fn upsert(&self, agent: &Agent) -> DbResult<Agent> {
        let labels = serde_json::to_value(&agent.labels)
            .map_err(|e| DbError::Corrupt(e.to_string()))?;
        let record = sqlx::query_as::<_, AgentRecord>(
            r#"
            INSERT INTO agents
                (id, name, url, labels, max_builds, current_builds, status,
                 last_heartbeat, system_info, org_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8, $9)
            ON CONFLICT (name) DO UPDATE
                SET url = EXCLUDED.url,
                    labels = EXCLUDED.labels,
                    max_builds = EXCLUDED.max_builds,
                    status = EXCLUDED.status,
                    last_heartbeat = NOW(),
                    system_info = EXCLUDED.system_info,
                    org_id = EXCLUDED.org_id
            RETURNING *
            "#,
        )
        .bind(agent.id.as_uuid())
        .bind(&agent.name)
        .bind(&agent.url)
        .bind(labels)
        .bind(agent.max_builds as i32)
        .bind(agent.current_builds as i32)
        .bind(agent.status.as_str())
        .bind(&agent.system_info)
        .bind(agent.org_id.map(|o| *o.as_uuid()))
        .fetch_one(self.db.write())
        .await?;
        record.into_core()
    }

    pub async fn heartbeat(
        &self,
        id: ResourceId,
        current_builds: u32,
        system_info: Option<&serde_json::Value>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agents
            SET last_heartbeat = NOW(),
                current_builds = $2,
                system_info = COALESCE($3, system_info)
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(current_builds as i32)
        .bind(system_info)
        .execute(self.db.write())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_status(&self, id: ResourceId, status: AgentStatus) -> DbResult<()> {
        sqlx::query("UPDATE agents SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(self.db.write())
            .await?;
        Ok(())
    }

    pub async fn set_current_builds(&self, id: ResourceId, current_builds: u32) -> DbResult<()> {
        sqlx::query("UPDATE agents SET current_builds = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(current_builds as i32)
            .execute(self.db.write())
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<Agent> {
        let record = sqlx::query_as::<_, AgentRecord>("SELECT * FROM agents WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.db.read())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("agent {id}")))?;
        record.into_core()
    }

    pub async fn list(&self) -> DbResult<Vec<Agent>> {
        let records = sqlx::query_as::<_, AgentRecord>("SELECT * FROM agents ORDER BY name")
            .fetch_all(self.db.read())
            .await?;
        records.into_iter().map(AgentRecord::into_core).collect()
    }
}
