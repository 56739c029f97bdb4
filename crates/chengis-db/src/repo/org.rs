//! Org repository. Orgs are the tenant boundary for jobs, secrets,
//! templates, policies and audit.

use chengis_core::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OrgRecord {
    pub id: uuid::Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

pub struct OrgRepo {
    db: RoutedDatasource,
}

impl OrgRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    pub async fn create(&self, name: &str) -> DbResult<OrgRecord> {
        sqlx::query_as::<_, OrgRecord>(
            r#"
            INSERT INTO orgs (id, name, created_at)
            VALUES ($1, $2, NOW())
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(name)
        .fetch_one(self.db.write())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("org {name}"))
            }
            _ => DbError::Database(e),
        })
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<OrgRecord> {
        sqlx::query_as::<_, OrgRecord>("SELECT * FROM orgs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.db.read())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("org {id}")))
    }

    pub async fn get_by_name(&self, name: &str) -> DbResult<OrgRecord> {
        sqlx::query_as::<_, OrgRecord>("SELECT * FROM orgs WHERE name = $1")
            .bind(name)
            .fetch_optional(self.db.read())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("org {name}")))
    }

    /// Get or create, for bootstrap paths.
    pub async fn ensure(&self, name: &str) -> DbResult<OrgRecord> {
        match self.get_by_name(name).await {
            Ok(org) => Ok(org),
            Err(DbError::NotFound(_)) => match self.create(name).await {
                Ok(org) => Ok(org),
                // Raced another creator; the row exists now.
                Err(DbError::Duplicate(_)) => self.get_by_name(name).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}
