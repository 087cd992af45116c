use rpl_core::PipelineError;
use rpl_sign::SignError;
use rpl_step::{CommandError, LockError};
use thiserror::Error;

/// Deploy failures are reported, never retried.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    #[error("cluster rejected apply: {0}")]
    Rejected(String),
    #[error("signature check failed: {0}")]
    Signature(#[from] SignError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("deployment log: {0}")]
    Record(String),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl From<DeployError> for PipelineError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Signature(s) => s.into(),
            other => PipelineError::Deploy(other.to_string()),
        }
    }
}
