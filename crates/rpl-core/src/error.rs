use thiserror::Error;

use crate::model::DeployStage;

/// Failure taxonomy shared by every pipeline step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("build failed: {0}")]
    Build(String),
    #[error("scan gate failed: {0}")]
    Scan(String),
    #[error("signature error: {0}")]
    Signature(String),
    #[error("registry error: {message}")]
    Registry { message: String, transient: bool },
    #[error("deploy failed: {0}")]
    Deploy(String),
    #[error("gate blocked for stage {stage}: {reason}")]
    GateBlocked { stage: DeployStage, reason: String },
    #[error("step {step} exceeded timeout of {secs}s")]
    Timeout { step: String, secs: u64 },
    #[error("run cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },
    /// Record, approval or artifact store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Only transient infrastructure failures are worth retrying.
    pub fn retryable(&self) -> bool {
        matches!(self, PipelineError::Registry { transient: true, .. })
    }

    /// Whether the error was caused by a cancellation request rather than a failing step.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_registry_errors_retry() {
        assert!(PipelineError::Registry { message: "503".into(), transient: true }.retryable());
        assert!(!PipelineError::Registry { message: "denied".into(), transient: false }.retryable());
        assert!(!PipelineError::Signature("bad".into()).retryable());
        assert!(!PipelineError::Deploy("unreachable".into()).retryable());
        assert!(!PipelineError::Build("javac".into()).retryable());
    }

    #[test]
    fn gate_blocks_are_not_cancellations() {
        assert!(PipelineError::Cancelled.is_cancellation());
        let blocked = PipelineError::GateBlocked {
            stage: DeployStage::Prod,
            reason: "dev never deployed".into(),
        };
        assert!(!blocked.is_cancellation());
        assert!(!PipelineError::Storage("disk full".into()).retryable());
    }
}
