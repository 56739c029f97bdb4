//! Retention sweeper.
//!
//! Deletes aged rows per resource type. Audit rows are removed strictly
//! by age, never by id range; build deletion cascades to stages, steps,
//! events, logs, artifacts and approval gates.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use tracing::info;

use crate::{DbResult, RoutedDatasource};

/// Per-resource retention ages, in days. A `None` disables sweeping for
/// that resource.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub audit_days: Option<i64>,
    pub builds_days: Option<i64>,
    pub webhook_events_days: Option<i64>,
    pub secret_audit_days: Option<i64>,
    /// Keep at most this many artifacts per job, newest first.
    pub artifacts_per_job: Option<i64>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            audit_days: Some(365),
            builds_days: Some(90),
            webhook_events_days: Some(30),
            secret_audit_days: Some(365),
            artifacts_per_job: Some(500),
        }
    }
}

pub struct RetentionSweeper {
    db: RoutedDatasource,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(db: RoutedDatasource, config: RetentionConfig) -> Self {
        Self { db, config }
    }

    /// One sweep across all resources. Returns cleaned counts keyed by
    /// resource type, for the metrics exporter.
    pub async fn sweep_once(&self) -> DbResult<HashMap<&'static str, u64>> {
        let mut counts = HashMap::new();

        if let Some(days) = self.config.audit_days {
            let n = self.delete_older_than("audit_logs", days).await?;
            counts.insert("audit", n);
        }
        if let Some(days) = self.config.secret_audit_days {
            let n = self.delete_older_than("secret_audit", days).await?;
            counts.insert("secret-audit", n);
        }
        if let Some(days) = self.config.webhook_events_days {
            let n = self.delete_older_than("webhook_events", days).await?;
            counts.insert("webhook-events", n);
        }
        if let Some(keep) = self.config.artifacts_per_job {
            let result = sqlx::query(
                r#"
                DELETE FROM artifacts WHERE id IN (
                    SELECT id FROM (
                        SELECT a.id,
                               ROW_NUMBER() OVER (
                                   PARTITION BY b.job_id
                                   ORDER BY a.created_at DESC
                               ) AS rank
                        FROM artifacts a
                        JOIN builds b ON b.id = a.build_id
                    ) ranked
                    WHERE ranked.rank > $1
                )
                "#,
            )
            .bind(keep)
            .execute(self.db.write())
            .await?;
            counts.insert("artifacts", result.rows_affected());
        }
        if let Some(days) = self.config.builds_days {
            let cutoff = Utc::now() - Duration::days(days);
            // Only terminal builds age out; a stuck running build is an
            // operational problem, not garbage.
            let result = sqlx::query(
                r#"
                DELETE FROM builds
                WHERE completed_at IS NOT NULL AND completed_at < $1
                "#,
            )
            .bind(cutoff)
            .execute(self.db.write())
            .await?;
            counts.insert("builds", result.rows_affected());
        }

        info!(?counts, "retention sweep complete");
        Ok(counts)
    }

    async fn delete_older_than(&self, table: &str, days: i64) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let query = format!("DELETE FROM {table} WHERE created_at < $1");
        let result = sqlx::query(&query)
            .bind(cutoff)
            .execute(self.db.write())
            .await?;
        Ok(result.rows_affected())
    }
}
