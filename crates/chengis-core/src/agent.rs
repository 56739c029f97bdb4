//! Agent fleet types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ResourceId;

/// Status of a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    Online,
    Offline,
    /// No new assignments; in-flight builds complete.
    Draining,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Draining => "draining",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "online" => AgentStatus::Online,
            "offline" => AgentStatus::Offline,
            "draining" => AgentStatus::Draining,
            _ => return None,
        })
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote executor that advertises labels and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: ResourceId,
    pub name: String,
    pub url: String,
    pub labels: BTreeSet<String>,
    pub max_builds: u32,
    pub current_builds: u32,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub system_info: serde_json::Value,
    /// None means the agent is shared across orgs.
    pub org_id: Option<ResourceId>,
}

impl Agent {
    /// Capacity/org/label part of eligibility. Circuit breaker state is
    /// layered on by the dispatcher.
    pub fn accepts(&self, org_id: ResourceId, required_labels: &[String]) -> bool {
        self.status == AgentStatus::Online
            && self.org_id.map(|o| o == org_id).unwrap_or(true)
            && self.current_builds < self.max_builds
            && required_labels.iter().all(|l| self.labels.contains(l))
    }

    /// Load ratio used for least-loaded selection.
    pub fn load_ratio(&self) -> f64 {
        if self.max_builds == 0 {
            return f64::INFINITY;
        }
        self.current_builds as f64 / self.max_builds as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(labels: &[&str], max: u32, current: u32) -> Agent {
        Agent {
            id: ResourceId::new(),
            name: "a1".into(),
            url: "http://a1:8080".into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            max_builds: max,
            current_builds: current,
            status: AgentStatus::Online,
            last_heartbeat: Utc::now(),
            system_info: serde_json::Value::Null,
            org_id: None,
        }
    }

    #[test]
    fn label_superset_required() {
        let org = ResourceId::new();
        let a = agent(&["linux", "docker"], 2, 0);
        assert!(a.accepts(org, &["linux".into()]));
        assert!(a.accepts(org, &[]));
        assert!(!a.accepts(org, &["linux".into(), "gpu".into()]));
    }

    #[test]
    fn full_agent_not_eligible() {
        let org = ResourceId::new();
        let a = agent(&[], 2, 2);
        assert!(!a.accepts(org, &[]));
    }

    #[test]
    fn org_scoped_agent_rejects_other_orgs() {
        let org = ResourceId::new();
        let other = ResourceId::new();
        let mut a = agent(&[], 2, 0);
        a.org_id = Some(org);
        assert!(a.accepts(org, &[]));
        assert!(!a.accepts(other, &[]));
    }

    #[test]
    fn draining_agent_not_eligible() {
        let org = ResourceId::new();
        let mut a = agent(&[], 2, 0);
        a.status = AgentStatus::Draining;
        assert!(!a.accepts(org, &[]));
    }

    #[test]
    fn load_ratio_orders_agents() {
        assert!(agent(&[], 4, 1).load_ratio() < agent(&[], 2, 1).load_ratio());
        assert_eq!(agent(&[], 0, 0).load_ratio(), f64::INFINITY);
    }
}
