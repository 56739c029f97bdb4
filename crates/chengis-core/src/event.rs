//! Build lifecycle events.
//!
//! Events flow through the in-process bus for live subscribers and are
//! mirrored synchronously to the durable per-build event log, which is the
//! source of truth for ordering within a build.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// Kind of a build lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    BuildQueued,
    BuildStarted,
    StageStarted,
    StageCompleted,
    StageSkipped,
    StepStarted,
    StepOutput,
    StepCompleted,
    WaitingApproval,
    ApprovalResolved,
    BuildCompleted,
    OrphanRecovered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BuildQueued => "build-queued",
            EventType::BuildStarted => "build-started",
            EventType::StageStarted => "stage-started",
            EventType::StageCompleted => "stage-completed",
            EventType::StageSkipped => "stage-skipped",
            EventType::StepStarted => "step-started",
            EventType::StepOutput => "step-output",
            EventType::StepCompleted => "step-completed",
            EventType::WaitingApproval => "waiting-approval",
            EventType::ApprovalResolved => "approval-resolved",
            EventType::BuildCompleted => "build-completed",
            EventType::OrphanRecovered => "orphan-recovered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "build-queued" => EventType::BuildQueued,
            "build-started" => EventType::BuildStarted,
            "stage-started" => EventType::StageStarted,
            "stage-completed" => EventType::StageCompleted,
            "stage-skipped" => EventType::StageSkipped,
            "step-started" => EventType::StepStarted,
            "step-output" => EventType::StepOutput,
            "step-completed" => EventType::StepCompleted,
            "waiting-approval" => EventType::WaitingApproval,
            "approval-resolved" => EventType::ApprovalResolved,
            "build-completed" => EventType::BuildCompleted,
            "orphan-recovered" => EventType::OrphanRecovered,
        _ => return None,
        })
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event in a build's lifecycle. `id` is time-ordered; events are
/// append-only and ordered by id within a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub event_type: EventType,
    pub stage_name: Option<String>,
    pub step_name: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl BuildEvent {
    pub fn new(build_id: ResourceId, event_type: EventType) -> Self {
        Self {
            id: ResourceId::new(),
            build_id,
            event_type,
            stage_name: None,
            step_name: None,
            data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage_name = Some(stage.into());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step_name = Some(step.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
