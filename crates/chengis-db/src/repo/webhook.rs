//! Webhook event log with delivery-id deduplication.

use chengis_core::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: uuid::Uuid,
    pub provider: String,
    pub event_type: String,
    pub delivery_id: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub signature_valid: bool,
    pub status: String,
    pub matched_jobs: i32,
    pub triggered_builds: i32,
    pub payload_size: i32,
    pub processing_ms: i64,
    pub org_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A webhook event row to record. Every event, accepted or rejected,
/// gets one.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider: String,
    pub event_type: String,
    pub delivery_id: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub signature_valid: bool,
    pub status: String,
    pub matched_jobs: i32,
    pub triggered_builds: i32,
    pub payload_size: i32,
    pub processing_ms: i64,
    pub org_id: Option<ResourceId>,
}

pub struct WebhookEventRepo {
    db: RoutedDatasource,
}

impl WebhookEventRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    /// Insert the event. Returns false when an event with the same
    /// `(provider, delivery_id)` was already recorded, which is the
    /// replay-deduplication signal.
    pub async fn record(&self, event: &NewWebhookEvent) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_events
                (id, provider, event_type, delivery_id, repo_url, branch, commit_sha,
                 signature_valid, status, matched_jobs, triggered_builds,
                 payload_size, processing_ms, org_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
            ON CONFLICT (provider, delivery_id) WHERE delivery_id IS NOT NULL DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&event.provider)
        .bind(&event.event_type)
        .bind(&event.delivery_id)
        .bind(&event.repo_url)
        .bind(&event.branch)
        .bind(&event.commit_sha)
        .bind(event.signature_valid)
        .bind(&event.status)
        .bind(event.matched_jobs)
        .bind(event.triggered_builds)
        .bind(event.payload_size)
        .bind(event.processing_ms)
        .bind(event.org_id.map(|o| *o.as_uuid()))
        .execute(self.db.write())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Whether a delivery has already been processed.
    pub async fn seen(&self, provider: &str, delivery_id: &str) -> DbResult<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT TRUE FROM webhook_events WHERE provider = $1 AND delivery_id = $2 LIMIT 1",
        )
        .bind(provider)
        .bind(delivery_id)
        .fetch_optional(self.db.write())
        .await?;
        Ok(row.is_some())
    }
}
