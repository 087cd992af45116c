use rpl_core::PipelineError;
use rpl_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),
    #[error("digest {digest} is not published under {repository}")]
    NotPushed { repository: String, digest: String },
    #[error("signature does not verify for digest {0}")]
    VerificationFailed(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<SignError> for PipelineError {
    fn from(e: SignError) -> Self {
        match e {
            SignError::Registry(r) => r.into(),
            other => PipelineError::Signature(other.to_string()),
        }
    }
}
