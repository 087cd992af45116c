use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*, time::EpochMs};

/// Immutable per-run context threaded through every stage call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: RunId,
    pub project_id: String,
    pub branch: String,
    pub commit_id: String,
    pub build_id: BuildId,
    pub repository: String,
    pub source_root: PathBuf,
    pub started_at_ms: EpochMs,
}

impl RunContext {
    pub fn image_ref(&self) -> ImageRef {
        ImageRef {
            repository: self.repository.clone(),
            tag: self.build_id.as_str().to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildArtifact {
    pub source_commit_id: String,
    pub build_id: BuildId,
    /// `sha256:<hex>` of the packaged artifact.
    pub artifact_digest: String,
    pub path: PathBuf,
}

/// A locally assembled image that has not been pushed yet.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// A pushed image. The digest is assigned by the registry and never changes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Image {
    pub repository: String,
    pub tag: String,
    pub digest: String,
}

impl Image {
    pub fn pinned_reference(&self) -> String {
        format!("{}@{}", self.repository, self.digest)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanTarget {
    Source { path: PathBuf },
    Image { image: ImageRef },
}

impl ScanTarget {
    /// Stable file-name friendly label, used for report names.
    pub fn label(&self) -> String {
        match self {
            ScanTarget::Source { .. } => "source".to_string(),
            ScanTarget::Image { image } => format!("image-{}", image.tag.replace(['/', ':'], "_")),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ScanTarget::Source { path } => path.display().to_string(),
            ScanTarget::Image { image } => image.reference(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub title: String,
    pub scanner: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResult {
    pub target: ScanTarget,
    pub severity_threshold: Severity,
    pub findings: Vec<Finding>,
    pub passed: bool,
    /// Scanner invocation errors that forced a fail-closed verdict.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ScanResult {
    pub fn blocking_findings(&self) -> impl Iterator<Item = &Finding> {
        let threshold = self.severity_threshold;
        self.findings.iter().filter(move |f| f.severity >= threshold)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    pub image_digest: String,
    pub signer_key_id: String,
    #[serde(with = "hex_bytes")]
    pub signature_bytes: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageDef {
    pub stage: DeployStage,
    pub branch_filter: String,
    pub depends_on: Option<DeployStage>,
    pub approval_required: bool,
    pub namespace: String,
    pub release_name: String,
}

impl StageDef {
    /// Conventional definition: branch, namespace and stage share a name.
    pub fn conventional(stage: DeployStage, release_name: &str) -> Self {
        Self {
            stage,
            branch_filter: stage.as_str().to_string(),
            depends_on: stage.predecessor(),
            approval_required: stage.approval_required_by_default(),
            namespace: stage.as_str().to_string(),
            release_name: release_name.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub run_id: RunId,
    pub stage: DeployStage,
    pub image: Image,
    pub namespace: String,
    pub release_name: String,
    pub outcome: DeployOutcome,
    /// Release revision reported by the cluster after the apply.
    pub revision: Option<u64>,
    pub error: Option<String>,
    pub recorded_at_ms: EpochMs,
}

/// Durable view of a run, sufficient to resume it at an approval gate.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub context: RunContext,
    pub state: RunState,
    pub halted_at: Option<DeployStage>,
    pub error: Option<String>,
    pub artifact: Option<BuildArtifact>,
    pub image: Option<Image>,
    pub signature: Option<Signature>,
    pub scans: Vec<ScanResult>,
    pub stages: Vec<crate::outcomes::StageOutcome>,
    pub updated_at_ms: EpochMs,
}

impl RunRecord {
    pub fn new(context: RunContext) -> Self {
        let updated_at_ms = context.started_at_ms;
        Self {
            context,
            state: RunState::Pending,
            halted_at: None,
            error: None,
            artifact: None,
            image: None,
            signature: None,
            scans: vec![],
            stages: vec![],
            updated_at_ms,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.context.run_id
    }

    pub fn stage_status(&self, stage: DeployStage) -> Option<StageStatus> {
        self.stages.iter().rev().find(|s| s.stage == stage).map(|s| s.status)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
