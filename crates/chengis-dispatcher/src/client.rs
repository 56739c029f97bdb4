//! HTTP client for remote agents.
//!
//! Implements the master side of the agent wire protocol: build
//! dispatch, cancellation, and artifact retrieval.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use chengis_core::agent::Agent;
use chengis_core::pipeline::Pipeline;
use chengis_core::{Error, ResourceId, Result};

/// The build request shipped to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDispatch {
    pub build_id: ResourceId,
    pub org_id: ResourceId,
    pub job_name: String,
    pub build_number: i64,
    pub pipeline: Pipeline,
    pub parameters: HashMap<String, String>,
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcceptedResponse {
    accepted: bool,
}

pub struct AgentClient {
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    fn url(agent: &Agent, tail: &str) -> String {
        format!(
            "{}/agent/{}/{}",
            agent.url.trim_end_matches('/'),
            agent.id,
            tail
        )
    }

    /// `POST /agent/<id>/build` — the agent acknowledges synchronously
    /// and reports progress through status events.
    pub async fn send_build(&self, agent: &Agent, dispatch: &BuildDispatch) -> Result<()> {
        let response = self
            .client
            .post(Self::url(agent, "build"))
            .json(dispatch)
            .send()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("agent {}: {e}", agent.name)))?;
        if !response.status().is_success() {
            return Err(Error::ExecutionFailed(format!(
                "agent {} refused build: {}",
                agent.name,
                response.status()
            )));
        }
        let body: AcceptedResponse = response
            .json()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("agent {}: {e}", agent.name)))?;
        if !body.accepted {
            return Err(Error::ExecutionFailed(format!(
                "agent {} did not accept the build",
                agent.name
            )));
        }
        Ok(())
    }

    /// `POST /agent/<id>/cancel/<build-id>`.
    pub async fn cancel(&self, agent: &Agent, build_id: ResourceId) -> Result<()> {
        let response = self
            .client
            .post(Self::url(agent, &format!("cancel/{build_id}")))
            .send()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("agent {}: {e}", agent.name)))?;
        if !response.status().is_success() {
            return Err(Error::ExecutionFailed(format!(
                "agent {} cancel failed: {}",
                agent.name,
                response.status()
            )));
        }
        Ok(())
    }

    /// `GET /agent/<id>/artifacts/<name>`.
    pub async fn fetch_artifact(&self, agent: &Agent, name: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(Self::url(agent, &format!("artifacts/{name}")))
            .send()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("agent {}: {e}", agent.name)))?;
        if !response.status().is_success() {
            return Err(Error::NotFound(format!(
                "artifact {name} on agent {}",
                agent.name
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("agent {}: {e}", agent.name)))?;
        Ok(bytes.to_vec())
    }
}

impl Default for AgentClient {
    fn default() -> Self {
        Self::new()
    }
}
