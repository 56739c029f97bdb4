//! Build-time secret resolution.
//!
//! Produces the plaintext env additions for one step: org globals,
//! overlaid by job-scoped secrets, overlaid by step-declared references.
//! Every access emits a secret-audit row. Backend errors obey the
//! `fallback_to_local` flag: off, the step fails with
//! `secret-backend-unavailable`; on, resolution continues against the
//! local backend and the fallback itself is audited.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use chengis_core::secret::{SecretAction, SecretBackend, SecretScope};
use chengis_core::{Error, ResourceId, Result};
use chengis_db::{AuditRepo, SecretAuditEntry, SecretRepo};

/// Receives secret-access and fallback audit events.
#[async_trait]
pub trait AccessAudit: Send + Sync {
    async fn secret_access(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
        action: SecretAction,
    ) -> Result<()>;

    async fn backend_fallback(&self, org_id: ResourceId, backend: &str, error: &str)
    -> Result<()>;
}

/// Production audit sink: secret_audit rows plus an audit-log entry for
/// fallbacks.
pub struct DbAccessAudit {
    secrets: Arc<SecretRepo>,
    audit: Arc<AuditRepo>,
}

impl DbAccessAudit {
    pub fn new(secrets: Arc<SecretRepo>, audit: Arc<AuditRepo>) -> Self {
        Self { secrets, audit }
    }
}

#[async_trait]
impl AccessAudit for DbAccessAudit {
    async fn secret_access(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
        action: SecretAction,
    ) -> Result<()> {
        self.secrets
            .audit(&SecretAuditEntry {
                org_id,
                secret_name: name,
                scope,
                action,
                user_id: None,
                ip: None,
            })
            .await
            .map_err(chengis_core::Error::from)
    }

    async fn backend_fallback(
        &self,
        org_id: ResourceId,
        backend: &str,
        error: &str,
    ) -> Result<()> {
        self.audit
            .append(
                org_id,
                None,
                "secret-backend-fallback",
                "secret-backend",
                backend,
                serde_json::json!({ "error": error }),
            )
            .await
            .map_err(chengis_core::Error::from)?;
        Ok(())
    }
}

/// No-op sink for tests.
pub struct NullAccessAudit;

#[async_trait]
impl AccessAudit for NullAccessAudit {
    async fn secret_access(
        &self,
        _org_id: ResourceId,
        _scope: &SecretScope,
        _name: &str,
        _action: SecretAction,
    ) -> Result<()> {
        Ok(())
    }

    async fn backend_fallback(
        &self,
        _org_id: ResourceId,
        _backend: &str,
        _error: &str,
    ) -> Result<()> {
        Ok(())
    }
}

pub struct SecretResolver {
    backend: Arc<dyn SecretBackend>,
    /// Fallback target when the configured backend errors.
    local: Option<Arc<dyn SecretBackend>>,
    fallback_to_local: bool,
    audit: Arc<dyn AccessAudit>,
}

impl SecretResolver {
    pub fn new(
        backend: Arc<dyn SecretBackend>,
        local: Option<Arc<dyn SecretBackend>>,
        fallback_to_local: bool,
        audit: Arc<dyn AccessAudit>,
    ) -> Self {
        Self {
            backend,
            local,
            fallback_to_local,
            audit,
        }
    }

    /// Resolve the secrets for one step of a build.
    pub async fn resolve_for_step(
        &self,
        org_id: ResourceId,
        job_id: ResourceId,
        step_refs: &[String],
    ) -> Result<HashMap<String, String>> {
        let job_scope = SecretScope::Job(job_id);

        let mut secrets: HashMap<String, String> = HashMap::new();
        let mut scopes: HashMap<String, SecretScope> = HashMap::new();
        for (name, value) in self.list_scope(org_id, &SecretScope::Global).await? {
            scopes.insert(name.clone(), SecretScope::Global);
            secrets.insert(name, value);
        }
        for (name, value) in self.list_scope(org_id, &job_scope).await? {
            scopes.insert(name.clone(), job_scope);
            secrets.insert(name, value);
        }

        // Step-declared references must all resolve.
        for name in step_refs {
            if secrets.contains_key(name) {
                continue;
            }
            if let Some(value) = self.get(org_id, &job_scope, name).await? {
                scopes.insert(name.clone(), job_scope);
                secrets.insert(name.clone(), value);
            } else if let Some(value) = self.get(org_id, &SecretScope::Global, name).await? {
                scopes.insert(name.clone(), SecretScope::Global);
                secrets.insert(name.clone(), value);
            } else {
                return Err(Error::MissingSecret(name.clone()));
            }
        }

        for name in secrets.keys() {
            let scope = scopes.get(name).copied().unwrap_or(SecretScope::Global);
            self.audit
                .secret_access(org_id, &scope, name, SecretAction::BuildRead)
                .await?;
        }

        Ok(secrets)
    }

    async fn list_scope(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
    ) -> Result<Vec<(String, String)>> {
        match self.backend.list(org_id, scope).await {
            Ok(secrets) => Ok(secrets),
            Err(e) => self.fall_back(org_id, &e).await?.list(org_id, scope).await,
        }
    }

    async fn get(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Option<String>> {
        match self.backend.get(org_id, scope, name).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.fall_back(org_id, &e)
                    .await?
                    .get(org_id, scope, name)
                    .await
            }
        }
    }

    /// Decide what a backend error means: the local fallback when
    /// enabled and available, otherwise `secret-backend-unavailable`.
    async fn fall_back(&self, org_id: ResourceId, error: &Error) -> Result<&Arc<dyn SecretBackend>> {
        if self.fallback_to_local {
            if let Some(local) = &self.local {
                warn!(backend = self.backend.name(), error = %error, "secret backend failed, falling back to local");
                self.audit
                    .backend_fallback(org_id, self.backend.name(), &error.to_string())
                    .await?;
                return Ok(local);
            }
        }
        Err(Error::SecretBackendUnavailable(format!(
            "{}: {error}",
            self.backend.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdMap;
    use std::sync::Mutex;

    /// In-memory backend; `fail` makes every call error.
    struct MemoryBackend {
        name: &'static str,
        fail: bool,
        values: Mutex<StdMap<(String, String), String>>,
    }

    impl MemoryBackend {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: false,
                values: Mutex::new(StdMap::new()),
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: true,
                values: Mutex::new(StdMap::new()),
            })
        }

        fn seed(self: &Arc<Self>, scope: &SecretScope, name: &str, value: &str) {
            self.values
                .lock()
                .unwrap()
                .insert((scope.as_string(), name.to_string()), value.to_string());
        }
    }

    #[async_trait]
    impl SecretBackend for MemoryBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn get(
            &self,
            _org_id: ResourceId,
            scope: &SecretScope,
            name: &str,
        ) -> Result<Option<String>> {
            if self.fail {
                return Err(Error::SecretBackendUnavailable("down".into()));
            }
            Ok(self
                .values
                .lock()
                .unwrap()
                .get(&(scope.as_string(), name.to_string()))
                .cloned())
        }

        async fn list(
            &self,
            _org_id: ResourceId,
            scope: &SecretScope,
        ) -> Result<Vec<(String, String)>> {
            if self.fail {
                return Err(Error::SecretBackendUnavailable("down".into()));
            }
            Ok(self
                .values
                .lock()
                .unwrap()
                .iter()
                .filter(|((s, _), _)| *s == scope.as_string())
                .map(|((_, n), v)| (n.clone(), v.clone()))
                .collect())
        }

        async fn put(
            &self,
            _org_id: ResourceId,
            scope: &SecretScope,
            name: &str,
            value: &str,
        ) -> Result<()> {
            self.values
                .lock()
                .unwrap()
                .insert((scope.as_string(), name.to_string()), value.to_string());
            Ok(())
        }

        async fn delete(
            &self,
            _org_id: ResourceId,
            scope: &SecretScope,
            name: &str,
        ) -> Result<()> {
            self.values
                .lock()
                .unwrap()
                .remove(&(scope.as_string(), name.to_string()));
            Ok(())
        }
    }

    fn resolver(backend: Arc<MemoryBackend>, local: Option<Arc<MemoryBackend>>, fallback: bool) -> SecretResolver {
        SecretResolver::new(
            backend,
            local.map(|l| l as Arc<dyn SecretBackend>),
            fallback,
            Arc::new(NullAccessAudit),
        )
    }

    #[tokio::test]
    async fn job_scope_overlays_globals() {
        let org = ResourceId::new();
        let job = ResourceId::new();
        let backend = MemoryBackend::new("local");
        backend.seed(&SecretScope::Global, "TOKEN", "global-token");
        backend.seed(&SecretScope::Global, "REGION", "eu");
        backend.seed(&SecretScope::Job(job), "TOKEN", "job-token");

        let resolved = resolver(backend, None, false)
            .resolve_for_step(org, job, &[])
            .await
            .unwrap();
        assert_eq!(resolved["TOKEN"], "job-token");
        assert_eq!(resolved["REGION"], "eu");
    }

    #[tokio::test]
    async fn missing_step_reference_fails() {
        let org = ResourceId::new();
        let job = ResourceId::new();
        let backend = MemoryBackend::new("local");

        let err = resolver(backend, None, false)
            .resolve_for_step(org, job, &["NOPE".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingSecret(_)));
    }

    #[tokio::test]
    async fn backend_error_without_fallback_is_unavailable() {
        let org = ResourceId::new();
        let job = ResourceId::new();
        let backend = MemoryBackend::failing("vault");

        let err = resolver(backend, None, false)
            .resolve_for_step(org, job, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretBackendUnavailable(_)));
    }

    #[tokio::test]
    async fn backend_error_with_fallback_uses_local() {
        let org = ResourceId::new();
        let job = ResourceId::new();
        let backend = MemoryBackend::failing("vault");
        let local = MemoryBackend::new("local");
        local.seed(&SecretScope::Global, "TOKEN", "from-local");

        let resolved = resolver(backend, Some(local), true)
            .resolve_for_step(org, job, &[])
            .await
            .unwrap();
        assert_eq!(resolved["TOKEN"], "from-local");
    }

    #[tokio::test]
    async fn fallback_disabled_even_when_local_present() {
        let org = ResourceId::new();
        let job = ResourceId::new();
        let backend = MemoryBackend::failing("vault");
        let local = MemoryBackend::new("local");
        local.seed(&SecretScope::Global, "TOKEN", "from-local");

        let err = resolver(backend, Some(local), false)
            .resolve_for_step(org, job, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretBackendUnavailable(_)));
    }
}
