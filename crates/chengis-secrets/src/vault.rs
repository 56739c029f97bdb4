//! Vault-style external KV backend.
//!
//! Speaks the KV v2 read/write surface over HTTP. Secrets live under
//! `<mount>/data/<org>/<scope>/<name>` with the plaintext in the
//! `value` field. Any transport or non-404 API error surfaces as
//! `SecretBackendUnavailable` so the resolver can apply the fallback
//! policy.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use chengis_core::secret::{SecretBackend, SecretScope};
use chengis_core::{Error, ResourceId, Result};

pub struct VaultBackend {
    client: reqwest::Client,
    base_url: String,
    mount: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Debug, Deserialize)]
struct ReadData {
    data: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Debug, Deserialize)]
struct ListData {
    keys: Vec<String>,
}

impl VaultBackend {
    pub fn new(base_url: impl Into<String>, mount: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            mount: mount.into(),
            token: token.into(),
        }
    }

    fn data_url(&self, org_id: ResourceId, scope: &SecretScope, name: &str) -> String {
        format!(
            "{}/v1/{}/data/{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.mount,
            org_id,
            scope.as_string(),
            name
        )
    }

    fn metadata_url(&self, org_id: ResourceId, scope: &SecretScope) -> String {
        format!(
            "{}/v1/{}/metadata/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.mount,
            org_id,
            scope.as_string()
        )
    }

    fn unavailable(e: impl std::fmt::Display) -> Error {
        Error::SecretBackendUnavailable(format!("vault: {e}"))
    }
}

#[async_trait]
impl SecretBackend for VaultBackend {
    fn name(&self) -> &'static str {
        "vault"
    }

    async fn get(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Option<String>> {
        let response = self
            .client
            .get(self.data_url(org_id, scope, name))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(Self::unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::unavailable(response.status()));
        }
        let body: ReadResponse = response.json().await.map_err(Self::unavailable)?;
        Ok(body.data.data.get("value").cloned())
    }

    async fn list(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
    ) -> Result<Vec<(String, String)>> {
        let response = self
            .client
            .get(format!("{}?list=true", self.metadata_url(org_id, scope)))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(Self::unavailable)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::unavailable(response.status()));
        }
        let body: ListResponse = response.json().await.map_err(Self::unavailable)?;

        let mut secrets = Vec::with_capacity(body.data.keys.len());
        for name in body.data.keys {
            if let Some(value) = self.get(org_id, scope, &name).await? {
                secrets.push((name, value));
            }
        }
        Ok(secrets)
    }

    async fn put(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.data_url(org_id, scope, name))
            .header("X-Vault-Token", &self.token)
            .json(&json!({ "data": { "value": value } }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !response.status().is_success() {
            return Err(Self::unavailable(response.status()));
        }
        Ok(())
    }

    async fn delete(&self, org_id: ResourceId, scope: &SecretScope, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.data_url(org_id, scope, name))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Self::unavailable(response.status()));
        }
        Ok(())
    }
}
