//! Secret references and the vault abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Ownership level of a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretScope {
    /// Visible to a single repository.
    Repo,
    /// Visible to every repository of an organization.
    Org,
    /// Shared with a team across repositories.
    Shared,
}

impl SecretScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretScope::Repo => "repo",
            SecretScope::Org => "org",
            SecretScope::Shared => "shared",
        }
    }
}

impl fmt::Display for SecretScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecretScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "repo" => Ok(SecretScope::Repo),
            "org" => Ok(SecretScope::Org),
            "shared" => Ok(SecretScope::Shared),
            other => Err(Error::InvalidArgument(format!(
                "unknown secret scope: {}",
                other
            ))),
        }
    }
}

/// A secret declared by a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Name the value is exposed under in the build environment.
    pub name: String,
    /// Lookup key inside the vault (e.g. `octocat/hello-world/token`).
    pub key: String,
    pub scope: SecretScope,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, key: impl Into<String>, scope: SecretScope) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            scope,
        }
    }
}

/// Trait for secret storage backends.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Get a secret value, failing with `NotFound` when it does not exist.
    async fn get(&self, scope: SecretScope, key: &str) -> Result<String>;
}
