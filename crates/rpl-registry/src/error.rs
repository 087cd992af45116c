use rpl_core::PipelineError;
use rpl_step::FailureClass;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Network blips, 5xx, rate limiting. Retried with backoff.
    #[error("transient registry failure: {0}")]
    Transient(String),
    #[error("registry rejected request: {0}")]
    Rejected(String),
    #[error("image {0} not found")]
    NotFound(String),
}

impl RegistryError {
    /// Retry classification, shared with the pipeline-wide taxonomy.
    pub fn class(&self) -> FailureClass {
        if PipelineError::from(self.clone()).retryable() {
            FailureClass::Transient
        } else {
            FailureClass::Deterministic
        }
    }
}

impl From<RegistryError> for PipelineError {
    fn from(e: RegistryError) -> Self {
        let transient = matches!(e, RegistryError::Transient(_));
        PipelineError::Registry {
            message: e.to_string(),
            transient,
        }
    }
}
