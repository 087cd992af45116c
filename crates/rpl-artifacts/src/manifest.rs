use rpl_core::{RunRecord, Severity, StageOutcome};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvidenceKind {
    ScanReport,
    DeployManifest,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanVerdict {
    pub target: String,
    pub threshold: Severity,
    pub passed: bool,
    pub findings: usize,
    pub blocking: usize,
}

/// What was built, from which commit, scanned how, signed by whom, deployed where.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvenanceManifest {
    pub run_id: String,
    pub project_id: String,
    pub branch: String,
    pub commit_id: String,
    pub build_id: String,
    pub state: String,

    pub artifact_digest: Option<String>,
    pub image: Option<String>,
    pub image_digest: Option<String>,
    pub signer_key_id: Option<String>,

    pub scans: Vec<ScanVerdict>,
    pub stages: Vec<StageOutcome>,
    pub error: Option<String>,
}

impl ProvenanceManifest {
    pub fn from_record(record: &RunRecord) -> Self {
        let ctx = &record.context;
        Self {
            run_id: ctx.run_id.to_string(),
            project_id: ctx.project_id.clone(),
            branch: ctx.branch.clone(),
            commit_id: ctx.commit_id.clone(),
            build_id: ctx.build_id.to_string(),
            state: record.state.label(),
            artifact_digest: record.artifact.as_ref().map(|a| a.artifact_digest.clone()),
            image: record.image.as_ref().map(|i| i.pinned_reference()),
            image_digest: record.image.as_ref().map(|i| i.digest.clone()),
            signer_key_id: record.signature.as_ref().map(|s| s.signer_key_id.clone()),
            scans: record
                .scans
                .iter()
                .map(|s| ScanVerdict {
                    target: s.target.describe(),
                    threshold: s.severity_threshold,
                    passed: s.passed,
                    findings: s.findings.len(),
                    blocking: s.blocking_findings().count(),
                })
                .collect(),
            stages: record.stages.clone(),
            error: record.error.clone(),
        }
    }
}
