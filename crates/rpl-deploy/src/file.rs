use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::{ApplyReceipt, ApplyRequest, ClusterApplier, DeployError};

/// Writes manifests to `<root>/<namespace>/<release>.yaml`, with the revision in a
/// `.rev` sidecar. Useful for dry runs and for handing manifests to a GitOps repo.
#[derive(Clone, Debug)]
pub struct FileCluster {
    root: PathBuf,
}

impl FileCluster {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn manifest_path(&self, namespace: &str, release_name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{release_name}.yaml"))
    }

    async fn read_revision(path: &Path) -> Result<u64, DeployError> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) => s
                .trim()
                .parse()
                .map_err(|_| DeployError::Rejected(format!("corrupt revision file {}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(DeployError::Unreachable(format!("{}: {e}", path.display()))),
        }
    }
}

#[async_trait]
impl ClusterApplier for FileCluster {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyReceipt, DeployError> {
        let path = self.manifest_path(&request.namespace, &request.release_name);
        let rev_path = path.with_extension("rev");
        let io = |e: std::io::Error| DeployError::Unreachable(format!("{}: {e}", path.display()));

        let revision = Self::read_revision(&rev_path).await?;
        if revision > 0 {
            if let Ok(current) = tokio::fs::read_to_string(&path).await {
                if current == request.manifest {
                    return Ok(ApplyReceipt {
                        revision: Some(revision),
                        changed: false,
                    });
                }
            }
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io)?;
        }
        tokio::fs::write(&path, &request.manifest).await.map_err(io)?;
        let next = revision + 1;
        tokio::fs::write(&rev_path, next.to_string()).await.map_err(io)?;
        info!(path = %path.display(), revision = next, "manifest written");
        Ok(ApplyReceipt {
            revision: Some(next),
            changed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpl_core::Image;

    fn request(manifest: &str) -> ApplyRequest {
        ApplyRequest {
            namespace: "staging".into(),
            release_name: "app".into(),
            image: Image {
                repository: "reg/app".into(),
                tag: "t".into(),
                digest: "sha256:aa".into(),
            },
            manifest: manifest.into(),
        }
    }

    #[tokio::test]
    async fn reapply_is_noop_and_change_bumps_revision() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = FileCluster::new(dir.path());

        let first = cluster.apply(&request("a: 1\n")).await.unwrap();
        let again = cluster.apply(&request("a: 1\n")).await.unwrap();
        assert_eq!(first, ApplyReceipt { revision: Some(1), changed: true });
        assert_eq!(again, ApplyReceipt { revision: Some(1), changed: false });

        let changed = cluster.apply(&request("a: 2\n")).await.unwrap();
        assert_eq!(changed.revision, Some(2));
        let on_disk = std::fs::read_to_string(cluster.manifest_path("staging", "app")).unwrap();
        assert_eq!(on_disk, "a: 2\n");
    }
}
