use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{ApplyReceipt, ApplyRequest, ClusterApplier, DeployError};

/// In-memory cluster for tests.
#[derive(Default)]
pub struct InMemoryCluster {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    releases: HashMap<(String, String), (String, u64)>,
    unreachable: bool,
    applies: u32,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).unreachable = unreachable;
    }

    /// Current manifest and revision of a release.
    pub fn release(&self, namespace: &str, release_name: &str) -> Option<(String, u64)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.releases.get(&(namespace.to_string(), release_name.to_string())).cloned()
    }

    pub fn apply_count(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).applies
    }
}

#[async_trait]
impl ClusterApplier for InMemoryCluster {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyReceipt, DeployError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.applies += 1;
        if inner.unreachable {
            return Err(DeployError::Unreachable(format!("namespace {}", request.namespace)));
        }
        let key = (request.namespace.clone(), request.release_name.clone());
        let receipt = match inner.releases.get_mut(&key) {
            Some((manifest, revision)) if *manifest == request.manifest => ApplyReceipt {
                revision: Some(*revision),
                changed: false,
            },
            Some((manifest, revision)) => {
                *manifest = request.manifest.clone();
                *revision += 1;
                ApplyReceipt {
                    revision: Some(*revision),
                    changed: true,
                }
            }
            None => {
                inner.releases.insert(key, (request.manifest.clone(), 1));
                ApplyReceipt {
                    revision: Some(1),
                    changed: true,
                }
            }
        };
        Ok(receipt)
    }
}
