//! Secret row and secret-audit storage. Rows hold ciphertext only.

use chengis_core::ResourceId;
use chengis_core::secret::{SecretAction, SecretScope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecretRecord {
    pub id: uuid::Uuid,
    pub org_id: uuid::Uuid,
    pub scope: String,
    pub name: String,
    pub ciphertext: String,
    /// SHA-256 of the plaintext, for drift detection without decryption.
    pub value_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One secret-audit row.
#[derive(Debug, Clone)]
pub struct SecretAuditEntry<'a> {
    pub org_id: ResourceId,
    pub secret_name: &'a str,
    pub scope: &'a SecretScope,
    pub action: SecretAction,
    pub user_id: Option<&'a str>,
    pub ip: Option<&'a str>,
}

pub struct SecretRepo {
    db: RoutedDatasource,
}

impl SecretRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    pub async fn upsert(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
        ciphertext: &str,
        value_hash: &str,
    ) -> DbResult<SecretRecord> {
        let record = sqlx::query_as::<_, SecretRecord>(
            r#"
            INSERT INTO secrets (id, org_id, scope, name, ciphertext, value_hash, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (org_id, scope, name) DO UPDATE
                SET ciphertext = EXCLUDED.ciphertext,
                    value_hash = EXCLUDED.value_hash,
                    updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(org_id.as_uuid())
        .bind(scope.as_string())
        .bind(name)
        .bind(ciphertext)
        .bind(value_hash)
        .fetch_one(self.db.write())
        .await?;
        Ok(record)
    }

    pub async fn fetch(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
    ) -> DbResult<Option<SecretRecord>> {
        let record = sqlx::query_as::<_, SecretRecord>(
            "SELECT * FROM secrets WHERE org_id = $1 AND scope = $2 AND name = $3",
        )
        .bind(org_id.as_uuid())
        .bind(scope.as_string())
        .bind(name)
        .fetch_optional(self.db.read())
        .await?;
        Ok(record)
    }

    pub async fn list_scope(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
    ) -> DbResult<Vec<SecretRecord>> {
        let records = sqlx::query_as::<_, SecretRecord>(
            "SELECT * FROM secrets WHERE org_id = $1 AND scope = $2 ORDER BY name",
        )
        .bind(org_id.as_uuid())
        .bind(scope.as_string())
        .fetch_all(self.db.read())
        .await?;
        Ok(records)
    }

    pub async fn delete(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "DELETE FROM secrets WHERE org_id = $1 AND scope = $2 AND name = $3",
        )
        .bind(org_id.as_uuid())
        .bind(scope.as_string())
        .bind(name)
        .execute(self.db.write())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("secret {name}")));
        }
        Ok(())
    }

    /// Append a secret-audit row. Every access goes through here.
    pub async fn audit(&self, entry: &SecretAuditEntry<'_>) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO secret_audit (id, org_id, secret_name, scope, action, user_id, ip, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(entry.org_id.as_uuid())
        .bind(entry.secret_name)
        .bind(entry.scope.as_string())
        .bind(entry.action.as_str())
        .bind(entry.user_id)
        .bind(entry.ip)
        .execute(self.db.write())
        .await?;
        Ok(())
    }
}
