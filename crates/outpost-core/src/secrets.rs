//! Secret-store lookups.
//!
//! The runner validates additional secret references before launch so a
//! bad reference fails the dispatch immediately instead of surfacing as an
//! opaque container-start failure.

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Read-side interface to the secret store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Whether a secret with this id exists and is readable.
    async fn exists(&self, secret_id: &str) -> Result<bool>;
}

// Compile-time assertion: SecretStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn SecretStore) {}
};

/// AWS Secrets Manager implementation.
#[derive(Clone)]
pub struct SecretsManagerStore {
    client: aws_sdk_secretsmanager::Client,
}

impl SecretsManagerStore {
    pub fn new(client: aws_sdk_secretsmanager::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for SecretsManagerStore {
    async fn exists(&self, secret_id: &str) -> Result<bool> {
        match self
            .client
            .get_secret_value()
            .secret_id(secret_id)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception()) =>
            {
                Ok(false)
            }
            Err(err) => {
                Err(anyhow::Error::from(err)).context(format!("failed to read secret {secret_id}"))
            }
        }
    }
}

/// A secret store that accepts every reference. Used when validation is
/// disabled and in tests.
#[derive(Debug, Clone, Default)]
pub struct AllowAllSecretStore;

#[async_trait]
impl SecretStore for AllowAllSecretStore {
    async fn exists(&self, _secret_id: &str) -> Result<bool> {
        Ok(true)
    }
}
