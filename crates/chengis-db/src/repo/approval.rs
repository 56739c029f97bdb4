//! Approval gate persistence.
//!
//! The state machine itself lives in `chengis_core::approval`; this repo
//! loads gates with their responses, persists new responses, and applies
//! status transitions with pending-only conditions so a gate never moves
//! out of a terminal state.

use chengis_core::ResourceId;
use chengis_core::approval::{ApprovalGate, Decision, GateResponse, GateStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DbError, DbResult, RoutedDatasource};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
struct GateRecord {
    id: uuid::Uuid,
    build_id: uuid::Uuid,
    stage_name: String,
    status: String,
    required_role: String,
    approver_group: serde_json::Value,
    min_approvals: i32,
    timeout_minutes: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
struct ResponseRecord {
    id: uuid::Uuid,
    gate_id: uuid::Uuid,
    user_name: String,
    decision: String,
    created_at: DateTime<Utc>,
}

fn into_core(record: GateRecord, responses: Vec<ResponseRecord>) -> DbResult<ApprovalGate> {
    let status = GateStatus::parse(&record.status)
        .ok_or_else(|| DbError::Corrupt(format!("gate status {}", record.status)))?;
    let approver_group: Vec<String> =
        serde_json::from_value(record.approver_group).unwrap_or_default();
    let responses = responses
        .into_iter()
        .map(|r| {
            let decision = match r.decision.as_str() {
                "approve" => Decision::Approve,
                "reject" => Decision::Reject,
                other => return Err(DbError::Corrupt(format!("decision {other}"))),
            };
            Ok(GateResponse {
                user: r.user_name,
                decision,
                at: r.created_at,
            })
        })
        .collect::<DbResult<Vec<_>>>()?;
    Ok(ApprovalGate {
        id: record.id.into(),
        build_id: record.build_id.into(),
        stage_name: record.stage_name,
        status,
        required_role: record.required_role,
        approver_group,
        min_approvals: record.min_approvals as u32,
        created_at: record.created_at,
        timeout_minutes: record.timeout_minutes,
        responses,
    })
}

pub struct ApprovalRepo {
    db: RoutedDatasource,
}

impl ApprovalRepo {
    pub fn new(db: RoutedDatasource) -> Self {
        Self { db }
    }

    /// Create a gate, or return the existing one for the same
    /// `(build_id, stage_name)` so a resumed build reuses its gate.
    pub async fn create_or_get(&self, gate: &ApprovalGate) -> DbResult<ApprovalGate> {
        let group = serde_json::to_value(&gate.approver_group)
            .map_err(|e| DbError::Corrupt(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO approval_gates
                (id, build_id, stage_name, status, required_role, approver_group,
                 min_approvals, timeout_minutes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (build_id, stage_name) DO NOTHING
            "#,
        )
        .bind(gate.id.as_uuid())
        .bind(gate.build_id.as_uuid())
        .bind(&gate.stage_name)
        .bind(gate.status.as_str())
        .bind(&gate.required_role)
        .bind(group)
        .bind(gate.min_approvals as i32)
        .bind(gate.timeout_minutes)
        .bind(gate.created_at)
        .execute(self.db.write())
        .await?;

        self.get(gate.build_id, &gate.stage_name)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("gate for {}", gate.stage_name)))
    }

    pub async fn get(
        &self,
        build_id: ResourceId,
        stage_name: &str,
    ) -> DbResult<Option<ApprovalGate>> {
        let record = sqlx::query_as::<_, GateRecord>(
            "SELECT * FROM approval_gates WHERE build_id = $1 AND stage_name = $2",
        )
        .bind(build_id.as_uuid())
        .bind(stage_name)
        .fetch_optional(self.db.write())
        .await?;
        match record {
            Some(record) => {
                let responses = self.responses(record.id).await?;
                Ok(Some(into_core(record, responses)?))
            }
            None => Ok(None),
        }
    }

    pub async fn get_by_id(&self, id: ResourceId) -> DbResult<ApprovalGate> {
        let record = sqlx::query_as::<_, GateRecord>(
            "SELECT * FROM approval_gates WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.db.write())
        .await?
        .ok_or_else(|| DbError::NotFound(format!("gate {id}")))?;
        let responses = self.responses(record.id).await?;
        into_core(record, responses)
    }

    async fn responses(&self, gate_id: uuid::Uuid) -> DbResult<Vec<ResponseRecord>> {
        let rows = sqlx::query_as::<_, ResponseRecord>(
            "SELECT * FROM approval_responses WHERE gate_id = $1 ORDER BY created_at",
        )
        .bind(gate_id)
        .fetch_all(self.db.write())
        .await?;
        Ok(rows)
    }

    /// Persist one response. The unique index enforces one response per
    /// user even under concurrent submissions.
    pub async fn add_response(
        &self,
        gate_id: ResourceId,
        user: &str,
        decision: Decision,
        at: DateTime<Utc>,
    ) -> DbResult<()> {
        let decision = match decision {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        };
        sqlx::query(
            r#"
            INSERT INTO approval_responses (id, gate_id, user_name, decision, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(gate_id.as_uuid())
        .bind(user)
        .bind(decision)
        .bind(at)
        .execute(self.db.write())
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("{user} already responded"))
            }
            _ => DbError::Database(e),
        })?;
        Ok(())
    }

    /// Move a pending gate to a terminal status. Returns false when the
    /// gate already resolved.
    pub async fn resolve(&self, gate_id: ResourceId, status: GateStatus) -> DbResult<bool> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            "UPDATE approval_gates SET status = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(gate_id.as_uuid())
        .bind(status.as_str())
        .execute(self.db.write())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// All pending gates, for the timeout sweeper.
    pub async fn pending(&self) -> DbResult<Vec<ApprovalGate>> {
        let records = sqlx::query_as::<_, GateRecord>(
            "SELECT * FROM approval_gates WHERE status = 'pending'",
        )
        .fetch_all(self.db.write())
        .await?;
        let mut gates = Vec::with_capacity(records.len());
        for record in records {
            let responses = self.responses(record.id).await?;
            gates.push(into_core(record, responses)?);
        }
        Ok(gates)
    }
}
