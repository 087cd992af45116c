use std::fmt;

use serde::{Deserialize, Serialize};

/// Deployment environments, in promotion order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    Dev,
    Staging,
    Prod,
}

impl DeployStage {
    pub const CHAIN: [DeployStage; 3] = [DeployStage::Dev, DeployStage::Staging, DeployStage::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStage::Dev => "dev",
            DeployStage::Staging => "staging",
            DeployStage::Prod => "prod",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" => Some(DeployStage::Dev),
            "staging" => Some(DeployStage::Staging),
            "prod" | "production" => Some(DeployStage::Prod),
            _ => None,
        }
    }

    /// The stage this one depends on. `None` means it depends only on the build chain.
    pub fn predecessor(&self) -> Option<DeployStage> {
        match self {
            DeployStage::Dev => None,
            DeployStage::Staging => Some(DeployStage::Dev),
            DeployStage::Prod => Some(DeployStage::Staging),
        }
    }

    /// Staging and prod sit behind a human approval unless configured otherwise.
    pub fn approval_required_by_default(&self) -> bool {
        !matches!(self, DeployStage::Dev)
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Building,
    Scanning,
    Signing,
    Pushed,
    Deploying(DeployStage),
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled)
    }

    pub fn label(&self) -> String {
        match self {
            RunState::Pending => "pending".into(),
            RunState::Building => "building".into(),
            RunState::Scanning => "scanning".into(),
            RunState::Signing => "signing".into(),
            RunState::Pushed => "pushed".into(),
            RunState::Deploying(stage) => format!("deploying:{}", stage.as_str()),
            RunState::Succeeded => "succeeded".into(),
            RunState::Failed => "failed".into(),
            RunState::Cancelled => "cancelled".into(),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Finding severity. Ordering is significant: thresholds compare with `>=`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" => Some(Severity::Unknown),
            "LOW" => Some(Severity::Low),
            "MEDIUM" | "MODERATE" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "unknown",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Branch filter did not match; the stage's condition was false.
    Skipped,
    AwaitingApproval,
}

impl StageStatus {
    /// Whether a dependent stage may proceed after this one. A skipped
    /// stage never deployed anything, so it does not count.
    pub fn permits_successor(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Succeeded,
    Failed,
}
