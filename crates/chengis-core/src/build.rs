//! Build, stage and step result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ResourceId;

/// Lifecycle status of a build. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Queued,
    WaitingApproval,
    Running,
    Success,
    Failure,
    Aborted,
    TimedOut,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failure | BuildStatus::Aborted | BuildStatus::TimedOut
        )
    }

    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::WaitingApproval => "waiting-approval",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Aborted => "aborted",
            BuildStatus::TimedOut => "timed-out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => BuildStatus::Queued,
            "waiting-approval" => BuildStatus::WaitingApproval,
            "running" => BuildStatus::Running,
            "success" => BuildStatus::Success,
            "failure" => BuildStatus::Failure,
            "aborted" => BuildStatus::Aborted,
            "timed-out" => BuildStatus::TimedOut,
            _ => return None,
        })
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What created a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    Manual,
    Webhook,
    Scheduled,
    Dependency,
    Retry,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Webhook => "webhook",
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Dependency => "dependency",
            TriggerKind::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "manual" => TriggerKind::Manual,
            "webhook" => TriggerKind::Webhook,
            "scheduled" => TriggerKind::Scheduled,
            "dependency" => TriggerKind::Dependency,
            "retry" => TriggerKind::Retry,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes the trigger that requested a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDescriptor {
    pub kind: TriggerKind,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Branch the trigger refers to, when known (webhook pushes).
    pub branch: Option<String>,
    /// Original build when retrying.
    pub parent_build_id: Option<ResourceId>,
    /// User or system that initiated the trigger.
    pub actor: Option<String>,
}

impl TriggerDescriptor {
    pub fn manual(parameters: HashMap<String, String>, actor: Option<String>) -> Self {
        Self {
            kind: TriggerKind::Manual,
            parameters,
            branch: None,
            parent_build_id: None,
            actor,
        }
    }
}

/// One execution attempt of a pipeline for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub org_id: ResourceId,
    /// Monotonic per-job number, gapless from 1.
    pub build_number: i64,
    pub trigger: TriggerKind,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    pub status: BuildStatus,
    pub branch: Option<String>,
    /// Labels an agent must advertise to be assigned this build.
    #[serde(default)]
    pub required_labels: Vec<String>,
    pub priority: i32,
    pub agent_id: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Previous attempt when this build is a retry.
    pub parent_build_id: Option<ResourceId>,
    /// First attempt in the retry chain (self for the first attempt).
    pub root_build_id: ResourceId,
    pub attempt_number: i32,
    pub failed_step: Option<String>,
    pub error_message: Option<String>,
}

/// Terminal status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Success,
    Failure,
    Aborted,
    TimedOut,
}

impl StepStatus {
    /// Severity rank: success < failure < aborted < timed-out.
    pub fn severity(&self) -> u8 {
        match self {
            StepStatus::Success => 0,
            StepStatus::Failure => 1,
            StepStatus::Aborted => 2,
            StepStatus::TimedOut => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Aborted => "aborted",
            StepStatus::TimedOut => "timed-out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => StepStatus::Success,
            "failure" => StepStatus::Failure,
            "aborted" => StepStatus::Aborted,
            "timed-out" => StepStatus::TimedOut,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw outcome of executing one step, before the runner stamps timing
/// and persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failure,
            exit_code: None,
            stdout: String::new(),
            stderr: message.into(),
        }
    }
}

/// Persisted result of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Status of a stage, including the non-executed cases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Success,
    Failure,
    Aborted,
    TimedOut,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Failure => "failure",
            StageStatus::Aborted => "aborted",
            StageStatus::TimedOut => "timed-out",
            StageStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fold step statuses into a stage status.
///
/// The worst status by severity wins, with one adjustment: steps aborted
/// because a sibling failed do not outrank the failure that caused them,
/// so a stage containing any failed step is `Failure` unless some step
/// timed out.
pub fn stage_status_from_steps(steps: &[StepStatus]) -> StageStatus {
    let worst = steps.iter().max_by_key(|s| s.severity());
    match worst {
        None | Some(StepStatus::Success) => StageStatus::Success,
        Some(StepStatus::TimedOut) => StageStatus::TimedOut,
        Some(StepStatus::Failure) => StageStatus::Failure,
        Some(StepStatus::Aborted) => {
            if steps.iter().any(|s| *s == StepStatus::Failure) {
                StageStatus::Failure
            } else {
                StageStatus::Aborted
            }
        }
    }
}

/// Result of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub name: String,
    pub status: StageStatus,
    pub steps: Vec<StepResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Final result of a build run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub build_id: ResourceId,
    pub status: BuildStatus,
    pub stages: Vec<StageOutcome>,
    pub failed_step: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing_set() {
        for s in [
            BuildStatus::Success,
            BuildStatus::Failure,
            BuildStatus::Aborted,
            BuildStatus::TimedOut,
        ] {
            assert!(s.is_terminal());
        }
        for s in [
            BuildStatus::Queued,
            BuildStatus::WaitingApproval,
            BuildStatus::Running,
        ] {
            assert!(!s.is_terminal());
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            BuildStatus::Queued,
            BuildStatus::WaitingApproval,
            BuildStatus::Running,
            BuildStatus::Success,
            BuildStatus::Failure,
            BuildStatus::Aborted,
            BuildStatus::TimedOut,
        ] {
            assert_eq!(BuildStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(BuildStatus::parse("bogus"), None);
    }

    #[test]
    fn stage_status_prefers_failure_over_induced_aborts() {
        // A failed parallel step cancels its siblings; the stage failed.
        let steps = [StepStatus::Failure, StepStatus::Aborted, StepStatus::Success];
        assert_eq!(stage_status_from_steps(&steps), StageStatus::Failure);
    }

    #[test]
    fn stage_status_aborted_without_failure() {
        let steps = [StepStatus::Aborted, StepStatus::Success];
        assert_eq!(stage_status_from_steps(&steps), StageStatus::Aborted);
    }

    #[test]
    fn stage_status_timeout_outranks_all() {
        let steps = [StepStatus::Failure, StepStatus::TimedOut];
        assert_eq!(stage_status_from_steps(&steps), StageStatus::TimedOut);
    }

    #[test]
    fn stage_status_all_success() {
        let steps = [StepStatus::Success, StepStatus::Success];
        assert_eq!(stage_status_from_steps(&steps), StageStatus::Success);
    }
}
