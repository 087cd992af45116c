use async_trait::async_trait;
use rpl_core::{Image, ImageRef};
use rpl_step::{retry_with_backoff, RetryPolicy};

use crate::RegistryError;

/// Content-addressed image registry. Digests are assigned on push and immutable.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn push(&self, image: &ImageRef) -> Result<Image, RegistryError>;

    /// Look up the digest currently published for a tag.
    async fn resolve(&self, image: &ImageRef) -> Result<Option<Image>, RegistryError>;

    /// Whether `digest` was pushed under `repository`.
    async fn contains(&self, repository: &str, digest: &str) -> Result<bool, RegistryError>;
}

/// Push with bounded exponential backoff on transient failures.
pub async fn push_with_retry(
    registry: &dyn Registry,
    image: &ImageRef,
    policy: &RetryPolicy,
) -> Result<Image, RegistryError> {
    retry_with_backoff(policy, "registry.push", RegistryError::class, move |_| registry.push(image)).await
}
