use serde::{Deserialize, Serialize};

use crate::{model::*, time::EpochMs};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: DeployStage,
    pub status: StageStatus,
    pub detail: Option<String>,
    pub at_ms: EpochMs,
}

/// Result of evaluating a deploy stage's gates, before signature verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Branch filter did not select this stage.
    Skip,
    AwaitApproval,
    Block { reason: String },
}
