//! In-memory agent registry.
//!
//! The working copy of the fleet, mirrored to the agents table so a
//! restarted master can rebuild it. Only the dispatcher mutates an
//! agent's `current_builds` counter and status.

use chrono::Utc;
use std::collections::HashMap;
use std::time::Instant;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use chengis_core::agent::{Agent, AgentStatus};
use chengis_core::{Error, ResourceId, Result};
use chengis_db::AgentRepo;

use crate::breaker::{BreakerConfig, CircuitBreaker};

struct AgentEntry {
    agent: Agent,
    breaker: CircuitBreaker,
}

pub struct AgentRegistry {
    repo: Arc<AgentRepo>,
    breaker_config: BreakerConfig,
    agents: RwLock<HashMap<ResourceId, AgentEntry>>,
}

impl AgentRegistry {
    pub fn new(repo: Arc<AgentRepo>, breaker_config: BreakerConfig) -> Self {
        Self {
            repo,
            breaker_config,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the in-memory fleet from storage after a restart.
    pub async fn load_from_store(&self) -> Result<usize> {
        let stored = self.repo.list().await.map_err(chengis_core::Error::from)?;
        let mut agents = self.agents.write().await;
        agents.clear();
        let count = stored.len();
        for agent in stored {
            agents.insert(
                agent.id,
                AgentEntry {
                    agent,
                    breaker: CircuitBreaker::new(self.breaker_config.clone()),
                },
            );
        }
        info!(agents = count, "agent registry loaded from store");
        Ok(count)
    }

    /// Register (or re-register) an agent.
    pub async fn register(&self, agent: Agent) -> Result<Agent> {
        let stored = self
            .repo
            .upsert(&agent)
            .await
            .map_err(chengis_core::Error::from)?;
        let mut agents = self.agents.write().await;
        agents.insert(
            stored.id,
            AgentEntry {
                agent: stored.clone(),
                breaker: CircuitBreaker::new(self.breaker_config.clone()),
            },
        );
        info!(agent = %stored.name, id = %stored.id, "agent registered");
        Ok(stored)
    }

    pub async fn heartbeat(
        &self,
        id: ResourceId,
        current_builds: u32,
        system_info: Option<serde_json::Value>,
    ) -> Result<()> {
        let known = self
            .repo
            .heartbeat(id, current_builds, system_info.as_ref())
            .await
            .map_err(chengis_core::Error::from)?;
        if !known {
            return Err(Error::NotFound(format!("agent {id}")));
        }
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(&id) {
            entry.agent.last_heartbeat = Utc::now();
            entry.agent.current_builds = current_builds;
            if entry.agent.status == AgentStatus::Offline {
                entry.agent.status = AgentStatus::Online;
            }
            if let Some(info) = system_info {
                entry.agent.system_info = info;
            }
        }
        Ok(())
    }

    pub async fn set_status(&self, id: ResourceId, status: AgentStatus) -> Result<()> {
        self.repo
            .set_status(id, status)
            .await
            .map_err(chengis_core::Error::from)?;
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(&id) {
            entry.agent.status = status;
        }
        Ok(())
    }

    /// Pick the eligible agent with the lowest load ratio (ties broken
    /// by earliest heartbeat) and reserve a slot on it. The breaker's
    /// half-open probe slot is acquired as part of the reservation.
    pub async fn select_and_reserve(
        &self,
        org_id: ResourceId,
        required_labels: &[String],
        now: Instant,
    ) -> Option<Agent> {
        let mut agents = self.agents.write().await;
        let mut candidates: Vec<&mut AgentEntry> = agents
            .values_mut()
            .filter(|entry| {
                entry.agent.accepts(org_id, required_labels)
                    && entry.breaker.is_available(now)
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.agent
                .load_ratio()
                .partial_cmp(&b.agent.load_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.agent.last_heartbeat.cmp(&b.agent.last_heartbeat))
        });

        let entry = candidates.into_iter().next()?;
        if !entry.breaker.acquire(now) {
            return None;
        }
        entry.agent.current_builds += 1;
        let snapshot = entry.agent.clone();
        drop(agents);
        // Mirror the counter; the cache remains authoritative for
        // selection.
        if let Err(e) = self
            .repo
            .set_current_builds(snapshot.id, snapshot.current_builds)
            .await
        {
            warn!(agent = %snapshot.id, error = %e, "failed to mirror current_builds");
        }
        Some(snapshot)
    }

    /// Release one reserved slot (build finished, failed to send, or
    /// was recovered).
    pub async fn release(&self, id: ResourceId) {
        let current = {
            let mut agents = self.agents.write().await;
            match agents.get_mut(&id) {
                Some(entry) => {
                    entry.agent.current_builds = entry.agent.current_builds.saturating_sub(1);
                    Some(entry.agent.current_builds)
                }
                None => None,
            }
        };
        if let Some(current) = current {
            if let Err(e) = self.repo.set_current_builds(id, current).await {
                warn!(agent = %id, error = %e, "failed to mirror current_builds");
            }
        }
    }

    pub async fn record_send_success(&self, id: ResourceId) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(&id) {
            entry.breaker.record_success();
        }
    }

    pub async fn record_send_failure(&self, id: ResourceId, now: Instant) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(&id) {
            entry.breaker.record_failure(now);
        }
    }

    /// Agents whose heartbeat is older than the dead threshold.
    pub async fn dead_agents(&self, dead_after: chrono::Duration) -> Vec<Agent> {
        let now = Utc::now();
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|entry| {
                entry.agent.status == AgentStatus::Online
                    && now - entry.agent.last_heartbeat > dead_after
            })
            .map(|entry| entry.agent.clone())
            .collect()
    }

    pub async fn get(&self, id: ResourceId) -> Option<Agent> {
        self.agents.read().await.get(&id).map(|e| e.agent.clone())
    }

    pub async fn list(&self) -> Vec<Agent> {
        let agents = self.agents.read().await;
        let mut list: Vec<Agent> = agents.values().map(|e| e.agent.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub async fn online_count(&self) -> usize {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|e| e.agent.status == AgentStatus::Online)
            .count()
    }
}
