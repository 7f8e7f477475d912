//! Secret resolution ahead of dispatch.

use futures::future::try_join_all;
use keel_core::secret::{SecretRef, Vault};
use keel_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Materializes a pipeline's secret references through a vault.
///
/// Resolution is all-or-nothing: the first reference that cannot be read
/// fails the whole call with `SecretUnavailable` naming that reference.
pub struct SecretGateway {
    vault: Arc<dyn Vault>,
    timeout: Duration,
}

impl SecretGateway {
    pub fn new(vault: Arc<dyn Vault>, timeout: Duration) -> Self {
        Self { vault, timeout }
    }

    pub fn vault_name(&self) -> &'static str {
        self.vault.name()
    }

    /// Resolve every reference, keyed by the name exposed to the build.
    pub async fn resolve(&self, refs: &[SecretRef]) -> Result<HashMap<String, String>> {
        let lookups = refs.iter().map(|secret| async move {
            match tokio::time::timeout(self.timeout, self.vault.get(secret.scope, &secret.key))
                .await
            {
                Ok(Ok(value)) => Ok((secret.name.clone(), value)),
                Ok(Err(e)) => Err(Error::SecretUnavailable {
                    name: secret.name.clone(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(Error::SecretUnavailable {
                    name: secret.name.clone(),
                    reason: format!("vault lookup timed out after {:?}", self.timeout),
                }),
            }
        });

        Ok(try_join_all(lookups).await?.into_iter().collect())
    }
}
