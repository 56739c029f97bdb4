//! Approval gate state machine.
//!
//! A gate suspends a stage until enough qualified users approve, a
//! rejection makes approval impossible, or the gate times out. Status
//! never returns to pending.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::ApprovalSpec;
use crate::{Error, ResourceId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

impl GateStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Pending => "pending",
            GateStatus::Approved => "approved",
            GateStatus::Rejected => "rejected",
            GateStatus::TimedOut => "timed-out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => GateStatus::Pending,
            "approved" => GateStatus::Approved,
            "rejected" => GateStatus::Rejected,
            "timed-out" => GateStatus::TimedOut,
            _ => return None,
        })
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Approve,
    Reject,
}

/// One user's response to a gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResponse {
    pub user: String,
    pub decision: Decision,
    pub at: DateTime<Utc>,
}

/// A manual approval gate, unique per `(build_id, stage_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub stage_name: String,
    pub status: GateStatus,
    pub required_role: String,
    pub approver_group: Vec<String>,
    pub min_approvals: u32,
    pub created_at: DateTime<Utc>,
    pub timeout_minutes: i64,
    pub responses: Vec<GateResponse>,
}

impl ApprovalGate {
    /// Create a gate for a stage. A non-empty group too small to ever
    /// reach `min_approvals`, or an empty group with `min_approvals > 1`,
    /// is unsatisfiable and starts out rejected.
    pub fn new(build_id: ResourceId, stage_name: &str, spec: &ApprovalSpec) -> Self {
        let unsatisfiable = if spec.approver_group.is_empty() {
            spec.min_approvals > 1
        } else {
            (spec.approver_group.len() as u32) < spec.min_approvals
        };
        Self {
            id: ResourceId::new(),
            build_id,
            stage_name: stage_name.to_string(),
            status: if unsatisfiable {
                GateStatus::Rejected
            } else {
                GateStatus::Pending
            },
            required_role: spec.required_role.clone(),
            approver_group: spec.approver_group.clone(),
            min_approvals: spec.min_approvals,
            created_at: Utc::now(),
            timeout_minutes: spec.timeout_minutes,
            responses: Vec::new(),
        }
    }

    pub fn approvals(&self) -> u32 {
        self.responses
            .iter()
            .filter(|r| r.decision == Decision::Approve)
            .count() as u32
    }

    pub fn rejections(&self) -> u32 {
        self.responses
            .iter()
            .filter(|r| r.decision == Decision::Reject)
            .count() as u32
    }

    /// Record one user's decision and return the resulting status.
    ///
    /// Each distinct user may respond at most once. When the group is
    /// non-empty, only group members may respond.
    pub fn respond(&mut self, user: &str, decision: Decision, at: DateTime<Utc>) -> Result<GateStatus> {
        if self.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "approval gate for stage {} already {}",
                self.stage_name, self.status
            )));
        }
        if !self.approver_group.is_empty() && !self.approver_group.iter().any(|u| u == user) {
            return Err(Error::Unauthorized(format!(
                "{user} is not in the approver group"
            )));
        }
        if self.responses.iter().any(|r| r.user == user) {
            return Err(Error::Conflict(format!("{user} has already responded")));
        }

        self.responses.push(GateResponse {
            user: user.to_string(),
            decision,
            at,
        });

        if self.approvals() >= self.min_approvals {
            self.status = GateStatus::Approved;
        } else if !self.approver_group.is_empty()
            && (self.approver_group.len() as u32).saturating_sub(self.rejections())
                < self.min_approvals
        {
            // Approval has become impossible.
            self.status = GateStatus::Rejected;
        }
        Ok(self.status)
    }

    /// Transition a pending gate to timed-out when its deadline passed.
    /// Returns true when the transition happened.
    pub fn check_timeout(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == GateStatus::Pending
            && now - self.created_at > Duration::minutes(self.timeout_minutes)
        {
            self.status = GateStatus::TimedOut;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(group: &[&str], min: u32) -> ApprovalSpec {
        ApprovalSpec {
            required_role: "deployer".into(),
            approver_group: group.iter().map(|s| s.to_string()).collect(),
            min_approvals: min,
            timeout_minutes: 60,
        }
    }

    fn gate(group: &[&str], min: u32) -> ApprovalGate {
        ApprovalGate::new(ResourceId::new(), "deploy", &spec(group, min))
    }

    #[test]
    fn approves_at_min_approvals() {
        let mut g = gate(&["alice", "bob", "carol"], 2);
        assert_eq!(g.respond("alice", Decision::Approve, Utc::now()).unwrap(), GateStatus::Pending);
        assert_eq!(g.respond("bob", Decision::Approve, Utc::now()).unwrap(), GateStatus::Approved);
        assert!(g.approvals() >= g.min_approvals);
    }

    #[test]
    fn rejects_when_approval_impossible() {
        // min 2 of {alice, bob, carol}: two rejections leave only one
        // possible approver.
        let mut g = gate(&["alice", "bob", "carol"], 2);
        g.respond("alice", Decision::Approve, Utc::now()).unwrap();
        assert_eq!(g.respond("bob", Decision::Reject, Utc::now()).unwrap(), GateStatus::Pending);
        assert_eq!(g.respond("carol", Decision::Reject, Utc::now()).unwrap(), GateStatus::Rejected);
    }

    #[test]
    fn duplicate_user_rejected() {
        let mut g = gate(&["alice", "bob"], 2);
        g.respond("alice", Decision::Approve, Utc::now()).unwrap();
        assert!(g.respond("alice", Decision::Approve, Utc::now()).is_err());
    }

    #[test]
    fn outsider_rejected_when_group_set() {
        let mut g = gate(&["alice"], 1);
        assert!(g.respond("mallory", Decision::Approve, Utc::now()).is_err());
    }

    #[test]
    fn terminal_gate_refuses_responses() {
        let mut g = gate(&["alice"], 1);
        g.respond("alice", Decision::Approve, Utc::now()).unwrap();
        assert_eq!(g.status, GateStatus::Approved);
        assert!(g.respond("bob", Decision::Approve, Utc::now()).is_err());
    }

    #[test]
    fn empty_group_min_one_accepts_anyone() {
        let mut g = gate(&[], 1);
        assert_eq!(g.status, GateStatus::Pending);
        assert_eq!(g.respond("anyone", Decision::Approve, Utc::now()).unwrap(), GateStatus::Approved);
    }

    #[test]
    fn empty_group_min_two_starts_rejected() {
        let g = gate(&[], 2);
        assert_eq!(g.status, GateStatus::Rejected);
    }

    #[test]
    fn undersized_group_starts_rejected() {
        let g = gate(&["alice"], 3);
        assert_eq!(g.status, GateStatus::Rejected);
    }

    #[test]
    fn times_out_after_deadline() {
        let mut g = gate(&["alice"], 1);
        assert!(!g.check_timeout(Utc::now()));
        assert!(g.check_timeout(Utc::now() + Duration::minutes(61)));
        assert_eq!(g.status, GateStatus::TimedOut);
        // Already terminal: no further transition.
        assert!(!g.check_timeout(Utc::now() + Duration::minutes(120)));
    }
}
