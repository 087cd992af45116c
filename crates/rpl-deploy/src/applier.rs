use async_trait::async_trait;
use rpl_core::Image;

use crate::DeployError;

#[derive(Clone, Debug)]
pub struct ApplyRequest {
    pub namespace: String,
    pub release_name: String,
    pub image: Image,
    /// Fully rendered manifest.
    pub manifest: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyReceipt {
    /// Release revision after the apply, when the cluster reports one.
    pub revision: Option<u64>,
    /// False when the cluster already held an identical manifest.
    pub changed: bool,
}

/// Applies a rendered manifest to one namespace. Implementations must be idempotent:
/// applying the same manifest twice leaves the release as it was after the first apply.
#[async_trait]
pub trait ClusterApplier: Send + Sync {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyReceipt, DeployError>;
}
