use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use rpl_core::{now_ms, DeployStage, EpochMs, PipelineError, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRecord {
    pub stage: DeployStage,
    pub run_id: RunId,
    pub approved_by: String,
    pub at_ms: EpochMs,
}

impl ApprovalRecord {
    pub fn now(stage: DeployStage, run_id: RunId, approved_by: impl Into<String>) -> Self {
        Self {
            stage,
            run_id,
            approved_by: approved_by.into(),
            at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approver must not be empty")]
    MissingApprover,
    #[error("approval store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt approval record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ApprovalError> for PipelineError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::MissingApprover => PipelineError::Config(e.to_string()),
            ApprovalError::Io { .. } | ApprovalError::Corrupt { .. } => PipelineError::Storage(e.to_string()),
        }
    }
}

/// Answers "is there an approval recorded for (stage, run)?".
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approval(&self, stage: DeployStage, run_id: &RunId) -> Result<Option<ApprovalRecord>, ApprovalError>;

    async fn record(&self, approval: ApprovalRecord) -> Result<(), ApprovalError>;

    async fn is_approved(&self, stage: DeployStage, run_id: &RunId) -> Result<bool, ApprovalError> {
        Ok(self.approval(stage, run_id).await?.is_some())
    }
}

/// In-memory approvals, for tests.
#[derive(Default)]
pub struct InMemoryApprovals {
    inner: Mutex<HashMap<(RunId, DeployStage), ApprovalRecord>>,
}

impl InMemoryApprovals {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalGate for InMemoryApprovals {
    async fn approval(&self, stage: DeployStage, run_id: &RunId) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.get(&(run_id.clone(), stage)).cloned())
    }

    async fn record(&self, approval: ApprovalRecord) -> Result<(), ApprovalError> {
        if approval.approved_by.trim().is_empty() {
            return Err(ApprovalError::MissingApprover);
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert((approval.run_id.clone(), approval.stage), approval);
        Ok(())
    }
}

/// One JSON file per approval: `<root>/<run_id>/<stage>.json`.
#[derive(Clone, Debug)]
pub struct FileApprovals {
    root: PathBuf,
}

impl FileApprovals {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, stage: DeployStage, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str()).join(format!("{}.json", stage.as_str()))
    }
}

#[async_trait]
impl ApprovalGate for FileApprovals {
    async fn approval(&self, stage: DeployStage, run_id: &RunId) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let path = self.path_for(stage, run_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ApprovalError::Io { path, source }),
        };
        let record: ApprovalRecord =
            serde_json::from_slice(&bytes).map_err(|source| ApprovalError::Corrupt { path: path.clone(), source })?;
        // A file copied between run dirs does not count.
        if record.stage != stage || &record.run_id != run_id {
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn record(&self, approval: ApprovalRecord) -> Result<(), ApprovalError> {
        if approval.approved_by.trim().is_empty() {
            return Err(ApprovalError::MissingApprover);
        }
        let path = self.path_for(approval.stage, &approval.run_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ApprovalError::Io { path: dir.to_path_buf(), source })?;
        }
        let json = serde_json::to_vec_pretty(&approval)
            .map_err(|source| ApprovalError::Corrupt { path: path.clone(), source })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|source| ApprovalError::Io { path: path.clone(), source })?;
        info!(run_id = %approval.run_id, stage = %approval.stage, by = %approval.approved_by, "approval recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_approval_is_scoped_to_run_and_stage() {
        let gate = InMemoryApprovals::new();
        let run = RunId::from_str("r1");
        gate.record(ApprovalRecord::now(DeployStage::Prod, run.clone(), "alice")).await.unwrap();
        assert!(gate.is_approved(DeployStage::Prod, &run).await.unwrap());
        assert!(!gate.is_approved(DeployStage::Staging, &run).await.unwrap());
        assert!(!gate.is_approved(DeployStage::Prod, &RunId::from_str("r2")).await.unwrap());
    }

    #[tokio::test]
    async fn empty_approver_rejected() {
        let gate = InMemoryApprovals::new();
        let err = gate
            .record(ApprovalRecord::now(DeployStage::Prod, RunId::from_str("r1"), "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::MissingApprover));
    }
}
