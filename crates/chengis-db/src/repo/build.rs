//! Build repository.
//!
//! Owns build numbering, the conditional status transitions and the
//! stage/step result tables. Build numbers are assigned under a per-job
//! advisory lock so they are monotonic and gapless; status transitions
//! are conditional updates that refuse stale states.

use chengis_core::ResourceId;
use chengis_core::build::{Build, BuildStatus, StageOutcome, TriggerKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cursor::{Cursor, Page, page_from_rows};
use crate::{DbError, DbResult, RoutedDatasource};

/// Step output beyond this many bytes rotates into `log_chunks`.
pub const STEP_OUTPUT_INLINE_LIMIT: usize = 64 * 1024;
const LOG_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub org_id: uuid::Uuid,
    pub build_number: i64,
    pub trigger: String,
    pub parameters: serde_json::Value,
    pub status: String,
    pub branch: Option<String>,
    pub required_labels: serde_json::Value,
    pub priority: i32,
    pub agent_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub parent_build_id: Option<uuid::Uuid>,
    pub root_build_id: uuid::Uuid,
    pub attempt_number: i32,
    pub failed_step: Option<String>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
}

impl BuildRecord {
    pub fn into_core(self) -> DbResult<Build> {
        let status = BuildStatus::parse(&self.status)
            .ok_or_else(|| DbError::Corrupt(format!("build status {}", self.status)))?;
        let trigger = TriggerKind::parse(&self.trigger)
            .ok_or_else(|| DbError::Corrupt(format!("trigger {}", self.trigger)))?;
        let parameters: HashMap<String, String> =
            serde_json::from_value(self.parameters).unwrap_or_default();
        let required_labels: Vec<String> =
            serde_json::from_value(self.required_labels).unwrap_or_default();
        Ok(Build {
            id: self.id.into(),
            job_id: self.job_id.into(),
            org_id: self.org_id.into(),
            build_number: self.build_number,
            trigger,
            parameters,
            status,
            branch: self.branch,
            required_labels,
            priority: self.priority,
            agent_id: self.agent_id.map(Into::into),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            parent_build_id: self.parent_build_id.map(Into::into),
            root_build_id: self.root_build_id.into(),
            attempt_number: self.attempt_number,
            failed_step: self.failed_step,
            error_message: self.error_message,
        })
    }
}

/// Inputs for creating a build row.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub job_id: ResourceId,
    pub org_id: ResourceId,
    pub trigger: TriggerKind,
    pub parameters: HashMap<String, String>,
    pub branch: Option<String>,
    pub required_labels: Vec<String>,
    pub priority: i32,
    /// Original build when this is a retry.
    pub parent_build_id: Option<ResourceId>,
}

pub struct BuildRepo {
    db: RoutedDatasource,
}

impl BuildRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    /// Insert a build in `queued` status with the next build number for
    /// its job. The per-job advisory lock serialises numbering so the
    /// sequence is 1..N with no duplicates or gaps. Retry lineage
    /// (attempt number, root build) is derived from the parent inside
    /// the same transaction.
    pub async fn create(&self, new: &NewBuild) -> DbResult<Build> {
        let mut tx = self.db.write().begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(new.job_id.as_uuid().to_string())
            .execute(&mut *tx)
            .await?;

        let (attempt_number, root_build_id) = match new.parent_build_id {
            Some(parent_id) => {
                let parent = sqlx::query_as::<_, BuildRecord>(
                    "SELECT * FROM builds WHERE id = $1",
                )
                .bind(parent_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("parent build {parent_id}")))?;
                (parent.attempt_number + 1, parent.root_build_id)
            }
            None => (1, uuid::Uuid::nil()),
        };

        let id = uuid::Uuid::now_v7();
        let root = if root_build_id.is_nil() { id } else { root_build_id };
        let parameters = serde_json::to_value(&new.parameters)
            .map_err(|e| DbError::Corrupt(e.to_string()))?;
        let labels = serde_json::to_value(&new.required_labels)
            .map_err(|e| DbError::Corrupt(e.to_string()))?;

        let record = sqlx::query_as::<_, BuildRecord>(
            r#"
            INSERT INTO builds
                (id, job_id, org_id, build_number, trigger, parameters, status,
                 branch, required_labels, priority, created_at,
                 parent_build_id, root_build_id, attempt_number)
            VALUES
                ($1, $2, $3,
                 (SELECT COALESCE(MAX(build_number), 0) + 1 FROM builds WHERE job_id = $2),
                 $4, $5, 'queued', $6, $7, $8, NOW(), $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new.job_id.as_uuid())
        .bind(new.org_id.as_uuid())
        .bind(new.trigger.as_str())
        .bind(parameters)
        .bind(&new.branch)
        .bind(labels)
        .bind(new.priority)
        .bind(new.parent_build_id.map(|p| *p.as_uuid()))
        .bind(root)
        .bind(attempt_number)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        record.into_core()
    }

    pub async fn get(&self, id: ResourceId) -> DbResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(self.db.read())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        record.into_core()
    }

    /// Current status straight from the primary, for transition checks.
    pub async fn status(&self, id: ResourceId) -> DbResult<BuildStatus> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM builds WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(self.db.write())
                .await?;
        let (status,) = status.ok_or_else(|| DbError::NotFound(format!("build {id}")))?;
        BuildStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("build status {status}")))
    }

    /// Oldest queued builds, by priority then age.
    pub async fn queued_batch(&self, limit: i64) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRecord>(
            r#"
            SELECT * FROM builds
            WHERE status = 'queued'
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.db.write())
        .await?;
        rows.into_iter().map(BuildRecord::into_core).collect()
    }

    /// Cursor-paginated listing of a job's builds, newest first.
    pub async fn list_for_job(
        &self,
        job_id: ResourceId,
        cursor: Option<&str>,
        limit: usize,
    ) -> DbResult<Page<Build>> {
        let rows = match cursor {
            Some(token) => {
                let cursor = Cursor::decode(token)?;
                let boundary_id: uuid::Uuid = cursor
                    .id
                    .parse()
                    .map_err(|_| DbError::BadCursor("bad id".into()))?;
                sqlx::query_as::<_, BuildRecord>(
                    r#"
                    SELECT * FROM builds
                    WHERE job_id = $1
                      AND (created_at < $2 OR (created_at = $2 AND id < $3))
                    ORDER BY created_at DESC, id DESC
                    LIMIT $4
                    "#,
                )
                .bind(job_id.as_uuid())
                .bind(cursor.ts)
                .bind(boundary_id)
                .bind((limit + 1) as i64)
                .fetch_all(self.db.read())
                .await?
            }
            None => {
                sqlx::query_as::<_, BuildRecord>(
                    r#"
                    SELECT * FROM builds
                    WHERE job_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(job_id.as_uuid())
                .bind((limit + 1) as i64)
                .fetch_all(self.db.read())
                .await?
            }
        };
        let page = page_from_rows(rows, limit, |row| (row.created_at, row.id.to_string()));
        let items = page
            .items
            .into_iter()
            .map(BuildRecord::into_core)
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Page {
            items,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    /// CAS a queued build to running, optionally assigning an agent.
    /// Returns false when another dispatcher won the race.
    pub async fn try_start(&self, id: ResourceId, agent_id: Option<ResourceId>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET status = 'running', agent_id = $2, started_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id.as_uuid())
        .bind(agent_id.map(|a| *a.as_uuid()))
        .execute(self.db.write())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Suspend a running build on an approval gate.
    pub async fn set_waiting_approval(&self, id: ResourceId) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'waiting-approval' WHERE id = $1 AND status = 'running'",
        )
        .bind(id.as_uuid())
        .execute(self.db.write())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Resume a build whose gate approved.
    pub async fn resume_running(&self, id: ResourceId) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'running' WHERE id = $1 AND status = 'waiting-approval'",
        )
        .bind(id.as_uuid())
        .execute(self.db.write())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Terminal transition. Refuses when the build is already terminal.
    pub async fn finalize(
        &self,
        id: ResourceId,
        status: BuildStatus,
        failed_step: Option<&str>,
        error_message: Option<&str>,
    ) -> DbResult<bool> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET status = $2, completed_at = NOW(), failed_step = $3, error_message = $4
            WHERE id = $1
              AND status IN ('queued', 'waiting-approval', 'running')
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(failed_step)
        .bind(error_message)
        .execute(self.db.write())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Roll a dead agent's running build back to queued.
    pub async fn requeue_orphan(&self, id: ResourceId, agent_id: ResourceId) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET status = 'queued', agent_id = NULL, started_at = NULL
            WHERE id = $1 AND status = 'running' AND agent_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(agent_id.as_uuid())
        .execute(self.db.write())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Builds currently assigned to an agent.
    pub async fn running_for_agent(&self, agent_id: ResourceId) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE agent_id = $1 AND status = 'running'",
        )
        .bind(agent_id.as_uuid())
        .fetch_all(self.db.write())
        .await?;
        rows.into_iter().map(BuildRecord::into_core).collect()
    }

    /// Record a user's intent to abort; the runner observes this at
    /// stage and step boundaries.
    pub async fn request_cancel(&self, id: ResourceId) -> DbResult<()> {
        sqlx::query("UPDATE builds SET cancel_requested = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.db.write())
            .await?;
        Ok(())
    }

    pub async fn cancel_requested(&self, id: ResourceId) -> DbResult<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT cancel_requested FROM builds WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(self.db.write())
                .await?;
        Ok(row.map(|(c,)| c).unwrap_or(false))
    }

    /// Age in seconds of the oldest queued build, for the queue gauge.
    pub async fn oldest_queued_age_secs(&self) -> DbResult<Option<i64>> {
        let row: Option<(f64,)> = sqlx::query_as(
            r#"
            SELECT EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::float8
            FROM builds WHERE status = 'queued'
            HAVING MIN(created_at) IS NOT NULL
            "#,
        )
        .fetch_optional(self.db.read())
        .await?;
        Ok(row.map(|(secs,)| secs as i64))
    }

    /// Persist a completed stage with its steps. Oversized step output
    /// rotates into the log-chunk table so build_steps rows stay bounded.
    pub async fn record_stage(&self, build_id: ResourceId, outcome: &StageOutcome, position: i32) -> DbResult<()> {
        let mut tx = self.db.write().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO build_stages (id, build_id, name, status, position, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(build_id.as_uuid())
        .bind(&outcome.name)
        .bind(outcome.status.as_str())
        .bind(position)
        .bind(outcome.started_at)
        .bind(outcome.completed_at)
        .execute(&mut *tx)
        .await?;

        for step in &outcome.steps {
            let step_id = uuid::Uuid::now_v7();
            let (stdout_inline, stdout_rest) = split_inline(&step.stdout);
            let (stderr_inline, stderr_rest) = split_inline(&step.stderr);
            sqlx::query(
                r#"
                INSERT INTO build_steps
                    (id, build_id, stage_name, name, status, exit_code,
                     stdout, stderr, duration_ms, started_at, completed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(step_id)
            .bind(build_id.as_uuid())
            .bind(&outcome.name)
            .bind(&step.name)
            .bind(step.status.as_str())
            .bind(step.exit_code)
            .bind(stdout_inline)
            .bind(stderr_inline)
            .bind(step.duration_ms)
            .bind(step.started_at)
            .bind(step.completed_at)
            .execute(&mut *tx)
            .await?;

            for (stream, rest) in [("stdout", stdout_rest), ("stderr", stderr_rest)] {
                let Some(rest) = rest else { continue };
                for (seq, chunk) in chunk_text(rest).into_iter().enumerate() {
                    sqlx::query(
                        r#"
                        INSERT INTO log_chunks (id, step_id, seq, stream, content)
                        VALUES ($1, $2, $3, $4, $5)
                        "#,
                    )
                    .bind(uuid::Uuid::now_v7())
                    .bind(step_id)
                    .bind(seq as i32)
                    .bind(stream)
                    .bind(chunk)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Reassemble a step's full output stream from the inline column and
    /// any rotated chunks.
    pub async fn step_output(
        &self,
        step_id: ResourceId,
        stream: &str,
    ) -> DbResult<String> {
        let column = match stream {
            "stderr" => "stderr",
            _ => "stdout",
        };
        let inline: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT {column} FROM build_steps WHERE id = $1"
        ))
        .bind(step_id.as_uuid())
        .fetch_optional(self.db.read())
        .await?;
        let (mut output,) =
            inline.ok_or_else(|| DbError::NotFound(format!("step {step_id}")))?;
        let chunks: Vec<(String,)> = sqlx::query_as(
            "SELECT content FROM log_chunks WHERE step_id = $1 AND stream = $2 ORDER BY seq",
        )
        .bind(step_id.as_uuid())
        .bind(column)
        .fetch_all(self.db.read())
        .await?;
        for (chunk,) in chunks {
            output.push_str(&chunk);
        }
        Ok(output)
    }
}

fn split_inline(text: &str) -> (&str, Option<&str>) {
    if text.len() <= STEP_OUTPUT_INLINE_LIMIT {
        return (text, None);
    }
    let cut = floor_char_boundary(text, STEP_OUTPUT_INLINE_LIMIT);
    (&text[..cut], Some(&text[cut..]))
}

fn chunk_text(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let cut = floor_char_boundary(rest, LOG_CHUNK_BYTES.min(rest.len()));
        let cut = if cut == 0 { rest.len() } else { cut };
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_inline_small_passes_through() {
        let (inline, rest) = split_inline("hello");
        assert_eq!(inline, "hello");
        assert!(rest.is_none());
    }

    #[test]
    fn split_inline_rotates_tail() {
        let text = "x".repeat(STEP_OUTPUT_INLINE_LIMIT + 10);
        let (inline, rest) = split_inline(&text);
        assert_eq!(inline.len(), STEP_OUTPUT_INLINE_LIMIT);
        assert_eq!(rest.unwrap().len(), 10);
    }

    #[test]
    fn chunking_respects_char_boundaries() {
        // Multibyte characters straddling the chunk boundary must not be
        // split.
        let text = "é".repeat(LOG_CHUNK_BYTES);
        let chunks = chunk_text(&text);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks.concat(), text);
    }
}
