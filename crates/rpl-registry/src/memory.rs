use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rpl_build::sha256_digest;
use rpl_core::{Image, ImageRef};

use crate::{Registry, RegistryError};

/// In-memory registry for tests. Digest is the sha256 of the content loaded for
/// the tag (as with `docker load`), or of the reference itself when none was loaded.
#[derive(Default)]
pub struct InMemoryRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    local: HashMap<ImageRef, Vec<u8>>,
    tags: HashMap<ImageRef, String>,
    digests: HashSet<(String, String)>,
    scripted_failures: VecDeque<RegistryError>,
    push_attempts: u32,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, image: &ImageRef, content: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.local.insert(image.clone(), content.to_vec());
    }

    /// The next pushes fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = RegistryError>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.scripted_failures.extend(errors);
    }

    pub fn push_attempts(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).push_attempts
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn push(&self, image: &ImageRef) -> Result<Image, RegistryError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.push_attempts += 1;
        if let Some(err) = inner.scripted_failures.pop_front() {
            return Err(err);
        }
        let digest = match inner.local.get(image) {
            Some(content) => sha256_digest(content),
            None => sha256_digest(image.reference().as_bytes()),
        };
        inner.tags.insert(image.clone(), digest.clone());
        inner.digests.insert((image.repository.clone(), digest.clone()));
        Ok(Image {
            repository: image.repository.clone(),
            tag: image.tag.clone(),
            digest,
        })
    }

    async fn resolve(&self, image: &ImageRef) -> Result<Option<Image>, RegistryError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.tags.get(image).map(|digest| Image {
            repository: image.repository.clone(),
            tag: image.tag.clone(),
            digest: digest.clone(),
        }))
    }

    async fn contains(&self, repository: &str, digest: &str) -> Result<bool, RegistryError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.digests.contains(&(repository.to_string(), digest.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push_with_retry;
    use rpl_step::RetryPolicy;
    use std::time::Duration;

    fn image(tag: &str) -> ImageRef {
        ImageRef {
            repository: "reg/app".into(),
            tag: tag.into(),
        }
    }

    #[tokio::test]
    async fn same_content_same_digest() {
        let reg = InMemoryRegistry::new();
        reg.load(&image("1"), b"layers");
        reg.load(&image("2"), b"layers");
        let a = reg.push(&image("1")).await.unwrap();
        let b = reg.push(&image("2")).await.unwrap();
        assert_eq!(a.digest, b.digest);
        assert!(reg.contains("reg/app", &a.digest).await.unwrap());
        assert!(!reg.contains("reg/other", &a.digest).await.unwrap());
    }

    #[tokio::test]
    async fn resolve_after_push() {
        let reg = InMemoryRegistry::new();
        assert_eq!(reg.resolve(&image("1")).await.unwrap(), None);
        let pushed = reg.push(&image("1")).await.unwrap();
        assert_eq!(reg.resolve(&image("1")).await.unwrap(), Some(pushed));
    }

    #[tokio::test]
    async fn transient_push_failures_are_retried() {
        let reg = InMemoryRegistry::new();
        reg.fail_next([
            RegistryError::Transient("503".into()),
            RegistryError::Transient("reset".into()),
        ]);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let img = push_with_retry(&reg, &image("1"), &policy).await.unwrap();
        assert_eq!(img.tag, "1");
        assert_eq!(reg.push_attempts(), 3);
    }

    #[tokio::test]
    async fn rejected_push_is_not_retried() {
        let reg = InMemoryRegistry::new();
        reg.fail_next([RegistryError::Rejected("denied".into())]);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let err = push_with_retry(&reg, &image("1"), &policy).await.unwrap_err();
        assert!(matches!(err, RegistryError::Rejected(_)));
        assert_eq!(reg.push_attempts(), 1);
    }
}
