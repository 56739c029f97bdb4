//! Interval schedules that enqueue builds.

use chengis_core::ResourceId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduleRecord {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub interval_seconds: i64,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub struct ScheduleRepo {
    db: RoutedDatasource,
}

impl ScheduleRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, job_id: ResourceId, interval_seconds: i64) -> DbResult<()> {
        let next_run_at = Utc::now() + Duration::seconds(interval_seconds);
        sqlx::query(
            r#"
            INSERT INTO cron_schedules (id, job_id, interval_seconds, next_run_at, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (job_id, interval_seconds) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(job_id.as_uuid())
        .bind(interval_seconds)
        .bind(next_run_at)
        .execute(self.db.write())
        .await?;
        Ok(())
    }

    /// Remove schedules for a job that are no longer declared.
    pub async fn prune(&self, job_id: ResourceId, keep_intervals: &[i64]) -> DbResult<()> {
        sqlx::query(
            "DELETE FROM cron_schedules WHERE job_id = $1 AND NOT (interval_seconds = ANY($2))",
        )
        .bind(job_id.as_uuid())
        .bind(keep_intervals)
        .execute(self.db.write())
        .await?;
        Ok(())
    }

    /// Schedules whose next run time has passed.
    pub async fn due(&self, now: DateTime<Utc>) -> DbResult<Vec<ScheduleRecord>> {
        let rows = sqlx::query_as::<_, ScheduleRecord>(
            "SELECT * FROM cron_schedules WHERE next_run_at <= $1",
        )
        .bind(now)
        .fetch_all(self.db.write())
        .await?;
        Ok(rows)
    }

    /// Advance the next run time after triggering. Skips ahead past any
    /// missed windows rather than firing a burst.
    pub async fn mark_ran(&self, id: uuid::Uuid, now: DateTime<Utc>) -> DbResult<()> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT interval_seconds FROM cron_schedules WHERE id = $1")
                .bind(id)
                .fetch_optional(self.db.write())
                .await?;
        let Some((interval,)) = row else {
            return Ok(());
        };
        let next = now + Duration::seconds(interval);
        sqlx::query("UPDATE cron_schedules SET next_run_at = $2 WHERE id = $1")
            .bind(id)
            .bind(next)
            .execute(self.db.write())
            .await?;
        Ok(())
    }
}
