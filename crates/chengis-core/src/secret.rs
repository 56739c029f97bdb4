//! Secret storage abstraction.
//!
//! Backends store ciphertext only; plaintext exists in memory for the
//! lifetime of a step's execution. Backend implementations live in
//! `chengis-secrets`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ResourceId, Result};

/// Where a secret applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretScope {
    /// Visible to every job in the org.
    Global,
    /// Visible to one job.
    Job(ResourceId),
}

impl SecretScope {
    /// Database/wire representation: `global` or `job-<id>`.
    pub fn as_string(&self) -> String {
        match self {
            SecretScope::Global => "global".to_string(),
            SecretScope::Job(id) => format!("job-{id}"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s == "global" {
            return Some(SecretScope::Global);
        }
        s.strip_prefix("job-")
            .and_then(|id| id.parse().ok())
            .map(SecretScope::Job)
    }
}

/// What touched a secret, for the secret-audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretAction {
    Read,
    Write,
    Delete,
    /// Resolution during step execution.
    BuildRead,
}

impl SecretAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretAction::Read => "read",
            SecretAction::Write => "write",
            SecretAction::Delete => "delete",
            SecretAction::BuildRead => "build-read",
        }
    }
}

/// Trait for secret storage backends.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch one secret's plaintext, or None when absent.
    async fn get(&self, org_id: ResourceId, scope: &SecretScope, name: &str)
    -> Result<Option<String>>;

    /// All secrets in a scope as name → plaintext.
    async fn list(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
    ) -> Result<Vec<(String, String)>>;

    /// Store or replace a secret.
    async fn put(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
        value: &str,
    ) -> Result<()>;

    /// Remove a secret.
    async fn delete(&self, org_id: ResourceId, scope: &SecretScope, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_round_trips() {
        let job = ResourceId::new();
        for scope in [SecretScope::Global, SecretScope::Job(job)] {
            assert_eq!(SecretScope::parse(&scope.as_string()), Some(scope));
        }
        assert_eq!(SecretScope::parse("nonsense"), None);
    }
}
