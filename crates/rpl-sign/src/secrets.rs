use std::path::PathBuf;

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::{KeyMaterial, SignError};

/// Source of the signing key. Fetched at stage start; callers must not persist it.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn signing_key(&self) -> Result<KeyMaterial, SignError>;
}

/// Hex seed held in an environment variable (CI secret injection).
#[derive(Clone, Debug)]
pub struct EnvSecretStore {
    pub var: String,
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn signing_key(&self) -> Result<KeyMaterial, SignError> {
        let value = Zeroizing::new(
            std::env::var(&self.var).map_err(|_| SignError::SecretUnavailable(format!("env var {} not set", self.var)))?,
        );
        KeyMaterial::from_hex(&value)
    }
}

/// Hex seed in a file, typically a tmpfs mount provided by the secret manager.
#[derive(Clone, Debug)]
pub struct FileSecretStore {
    pub path: PathBuf,
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn signing_key(&self) -> Result<KeyMaterial, SignError> {
        let value = Zeroizing::new(
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| SignError::SecretUnavailable(format!("{}: {e}", self.path.display())))?,
        );
        KeyMaterial::from_hex(&value)
    }
}

/// Key held in memory, for tests.
pub struct StaticSecretStore {
    seed: Zeroizing<[u8; 32]>,
}

impl StaticSecretStore {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed: Zeroizing::new(seed),
        }
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn signing_key(&self) -> Result<KeyMaterial, SignError> {
        Ok(KeyMaterial::from_seed(*self.seed))
    }
}

/// `env:VAR` or `file:/path/to/seed`.
pub fn secret_store_from_ref(reference: &str) -> Result<Box<dyn SecretStore>, SignError> {
    match reference.split_once(':') {
        Some(("env", var)) if !var.is_empty() => Ok(Box::new(EnvSecretStore { var: var.to_string() })),
        Some(("file", path)) if !path.is_empty() => Ok(Box::new(FileSecretStore {
            path: PathBuf::from(shellexpand::tilde(path).into_owned()),
        })),
        _ => Err(SignError::SecretUnavailable(format!(
            "unsupported secret reference {reference:?} (expected env:VAR or file:PATH)"
        ))),
    }
}
