//! Vault drivers.
//!
//! Secrets are addressed as `secret/<scope>/<key>`.

use async_trait::async_trait;
use keel_core::secret::{SecretScope, Vault};
use keel_core::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// In-memory vault for development and tests.
#[derive(Debug, Default)]
pub struct MemoryVault {
    secrets: RwLock<HashMap<(SecretScope, String), String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(
        mut self,
        scope: SecretScope,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.secrets
            .get_mut()
            .insert((scope, key.into()), value.into());
        self
    }

    pub async fn insert(&self, scope: SecretScope, key: impl Into<String>, value: impl Into<String>) {
        self.secrets
            .write()
            .await
            .insert((scope, key.into()), value.into());
    }
}

#[async_trait]
impl Vault for MemoryVault {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, scope: SecretScope, key: &str) -> Result<String> {
        self.secrets
            .read()
            .await
            .get(&(scope, key.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret/{}/{}", scope, key)))
    }
}

/// Client for a HashiCorp Vault compatible KV version 2 engine mounted at
/// `secret/`. The secret value is read from the `value` field.
#[derive(Debug, Clone)]
pub struct HttpVault {
    client: reqwest::Client,
    addr: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KvResponse {
    data: KvData,
}

#[derive(Debug, Deserialize)]
struct KvData {
    data: HashMap<String, String>,
}

impl HttpVault {
    pub fn new(addr: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("vault client: {}", e)))?;

        Ok(Self {
            client,
            addr: addr.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, scope: SecretScope, key: &str) -> String {
        format!("{}/v1/secret/data/{}/{}", self.addr, scope, key)
    }
}

#[async_trait]
impl Vault for HttpVault {
    fn name(&self) -> &'static str {
        "vault"
    }

    async fn get(&self, scope: SecretScope, key: &str) -> Result<String> {
        let mut request = self.client.get(self.url(scope, key));
        if let Some(token) = &self.token {
            request = request.header("X-Vault-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("vault request: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("secret/{}/{}", scope, key)));
        }
        if !status.is_success() {
            return Err(Error::Unavailable(format!(
                "vault returned {} for secret/{}/{}",
                status, scope, key
            )));
        }

        let mut body: KvResponse = response
            .json()
            .await
            .map_err(|e| Error::Unavailable(format!("vault response: {}", e)))?;

        body.data
            .data
            .remove("value")
            .ok_or_else(|| Error::NotFound(format!("secret/{}/{} has no value", scope, key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_vault_scopes_keys() {
        let vault = MemoryVault::new().with_secret(SecretScope::Repo, "octocat/hello/token", "abc");
        vault.insert(SecretScope::Shared, "registry", "xyz").await;

        assert_eq!(
            vault
                .get(SecretScope::Repo, "octocat/hello/token")
                .await
                .unwrap(),
            "abc"
        );
        assert_eq!(
            vault.get(SecretScope::Shared, "registry").await.unwrap(),
            "xyz"
        );
        assert!(matches!(
            vault.get(SecretScope::Org, "octocat/hello/token").await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_http_vault_url() {
        let vault = HttpVault::new("http://vault:8200/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            vault.url(SecretScope::Org, "octocat/npm_token"),
            "http://vault:8200/v1/secret/data/org/octocat/npm_token"
        );
    }

    #[test]
    fn test_kv_response_shape() {
        let body = r#"{"data":{"data":{"value":"s3cr3t"},"metadata":{"version":2}}}"#;
        let mut parsed: KvResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.data.remove("value").unwrap(), "s3cr3t");
    }
}
