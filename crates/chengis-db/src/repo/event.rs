//! Durable per-build event log.
//!
//! Every lifecycle event is appended synchronously; the log is the
//! source of truth for log tails, SSE streams and resumption. Events
//! are ordered by their time-ordered id within a build.

use chengis_core::ResourceId;
use chengis_core::event::{BuildEvent, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: uuid::Uuid,
    pub build_id: uuid::Uuid,
    pub event_type: String,
    pub stage_name: Option<String>,
    pub step_name: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn into_core(self) -> DbResult<BuildEvent> {
        let event_type = EventType::parse(&self.event_type)
            .ok_or_else(|| DbError::Corrupt(format!("event type {}", self.event_type)))?;
        Ok(BuildEvent {
            id: self.id.into(),
            build_id: self.build_id.into(),
            event_type,
            stage_name: self.stage_name,
            step_name: self.step_name,
            data: self.data,
            created_at: self.created_at,
        })
    }
}

pub struct EventRepo {
    db: RoutedDatasource,
}

impl EventRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    pub async fn append(&self, event: &BuildEvent) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO build_events (id, build_id, event_type, stage_name, step_name, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.build_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.stage_name)
        .bind(&event.step_name)
        .bind(&event.data)
        .bind(event.created_at)
        .execute(self.db.write())
        .await?;
        Ok(())
    }

    /// Events strictly greater than `after`, oldest first.
    pub async fn list(
        &self,
        build_id: ResourceId,
        after: Option<ResourceId>,
        limit: i64,
    ) -> DbResult<Vec<BuildEvent>> {
        let rows = match after {
            Some(after) => {
                sqlx::query_as::<_, EventRecord>(
                    r#"
                    SELECT * FROM build_events
                    WHERE build_id = $1 AND id > $2
                    ORDER BY id ASC
                    LIMIT $3
                    "#,
                )
                .bind(build_id.as_uuid())
                .bind(after.as_uuid())
                .bind(limit)
                .fetch_all(self.db.read())
                .await?
            }
            None => {
                sqlx::query_as::<_, EventRecord>(
                    r#"
                    SELECT * FROM build_events
                    WHERE build_id = $1
                    ORDER BY id ASC
                    LIMIT $2
                    "#,
                )
                .bind(build_id.as_uuid())
                .bind(limit)
                .fetch_all(self.db.read())
                .await?
            }
        };
        rows.into_iter().map(EventRecord::into_core).collect()
    }

    /// Whether the log already holds a terminal event for the build.
    /// Used by orphan recovery to avoid reviving completed builds.
    pub async fn has_terminal_event(&self, build_id: ResourceId) -> DbResult<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            SELECT TRUE FROM build_events
            WHERE build_id = $1 AND event_type = 'build-completed'
            LIMIT 1
            "#,
        )
        .bind(build_id.as_uuid())
        .fetch_optional(self.db.write())
        .await?;
        Ok(row.is_some())
    }
}
