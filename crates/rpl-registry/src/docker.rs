use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rpl_build::is_valid_digest;
use rpl_core::{Image, ImageRef};
use rpl_step::{run_command, CommandError, CommandOutput};
use tracing::{debug, info};

use crate::{Registry, RegistryError};

/// Registry access through the docker CLI (`docker push` / `docker inspect`).
#[derive(Clone, Debug)]
pub struct DockerRegistry {
    pub program: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

impl DockerRegistry {
    pub fn new(workdir: PathBuf, timeout: Duration) -> Self {
        Self {
            program: "docker".to_string(),
            workdir,
            timeout,
        }
    }

    async fn docker(&self, args: &[String]) -> Result<CommandOutput, RegistryError> {
        run_command(&self.workdir, &self.program, args, None, self.timeout)
            .await
            .map_err(|e| match e {
                CommandError::TimedOut { .. } => RegistryError::Transient(e.to_string()),
                other => RegistryError::Rejected(other.to_string()),
            })
    }

    async fn inspect_repo_digests(&self, image: &ImageRef) -> Result<Vec<String>, RegistryError> {
        let out = self
            .docker(&[
                "image".into(),
                "inspect".into(),
                "--format".into(),
                "{{range .RepoDigests}}{{println .}}{{end}}".into(),
                image.reference(),
            ])
            .await?;
        if !out.success() {
            return Err(RegistryError::NotFound(image.reference()));
        }
        Ok(out
            .stdout_str()
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

/// Classify docker push stderr. Anything that looks like the network or the
/// registry being briefly unavailable is transient.
pub fn classify_push_failure(stderr: &str) -> RegistryError {
    let lower = stderr.to_ascii_lowercase();
    const TRANSIENT: [&str; 8] = [
        "timeout",
        "connection reset",
        "connection refused",
        "502",
        "503",
        "504",
        "toomanyrequests",
        "tls handshake",
    ];
    if TRANSIENT.iter().any(|needle| lower.contains(needle)) {
        RegistryError::Transient(stderr.trim().to_string())
    } else {
        RegistryError::Rejected(stderr.trim().to_string())
    }
}

/// Interpret a failed or successful `docker manifest inspect repo@digest`.
/// Only an explicit "manifest unknown" answer means the digest is absent; auth
/// failures are rejections and anything else (network, registry 5xx) is transient.
pub fn classify_manifest_inspect(success: bool, stderr: &str) -> Result<bool, RegistryError> {
    if success {
        return Ok(true);
    }
    let lower = stderr.to_ascii_lowercase();
    const MISSING: [&str; 3] = ["no such manifest", "manifest unknown", "not found"];
    const DENIED: [&str; 3] = ["denied", "unauthorized", "forbidden"];
    if MISSING.iter().any(|needle| lower.contains(needle)) {
        Ok(false)
    } else if DENIED.iter().any(|needle| lower.contains(needle)) {
        Err(RegistryError::Rejected(stderr.trim().to_string()))
    } else {
        Err(RegistryError::Transient(stderr.trim().to_string()))
    }
}

/// Extract the digest from `docker push` output (`<tag>: digest: sha256:... size: N`).
pub fn parse_push_digest(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let idx = line.find("digest: ")?;
        let rest = &line[idx + "digest: ".len()..];
        rest.split_whitespace().next().map(|d| d.to_string())
    })
}

/// Pick the digest for `repository` out of `RepoDigests` (`repo@sha256:...`).
pub fn digest_for_repository(repo_digests: &[String], repository: &str) -> Option<String> {
    repo_digests.iter().find_map(|entry| {
        let (repo, digest) = entry.split_once('@')?;
        (repo == repository).then(|| digest.to_string())
    })
}

#[async_trait]
impl Registry for DockerRegistry {
    async fn push(&self, image: &ImageRef) -> Result<Image, RegistryError> {
        let out = self.docker(&["push".into(), image.reference()]).await?;
        if !out.success() {
            return Err(classify_push_failure(&out.stderr_str()));
        }
        let digest = match parse_push_digest(&out.stdout_str()) {
            Some(d) => d,
            None => {
                debug!("push output had no digest line; falling back to inspect");
                let digests = self.inspect_repo_digests(image).await?;
                digest_for_repository(&digests, &image.repository)
                    .ok_or_else(|| RegistryError::Rejected(format!("no repo digest for {}", image.reference())))?
            }
        };
        if !is_valid_digest(&digest) {
            return Err(RegistryError::Rejected(format!(
                "registry reported malformed digest {digest:?} for {}",
                image.reference()
            )));
        }
        info!(image = %image.reference(), %digest, "pushed");
        Ok(Image {
            repository: image.repository.clone(),
            tag: image.tag.clone(),
            digest,
        })
    }

    async fn resolve(&self, image: &ImageRef) -> Result<Option<Image>, RegistryError> {
        let digests = match self.inspect_repo_digests(image).await {
            Ok(d) => d,
            Err(RegistryError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(digest_for_repository(&digests, &image.repository).map(|digest| Image {
            repository: image.repository.clone(),
            tag: image.tag.clone(),
            digest,
        }))
    }

    async fn contains(&self, repository: &str, digest: &str) -> Result<bool, RegistryError> {
        let pinned = format!("{repository}@{digest}");
        let out = self
            .docker(&["manifest".into(), "inspect".into(), pinned])
            .await?;
        classify_manifest_inspect(out.success(), &out.stderr_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_push_digest_line() {
        let out = "The push refers to repository [reg/app]\n5f70bf18a086: Pushed\n1: digest: sha256:abcd size: 528";
        assert_eq!(parse_push_digest(out), Some("sha256:abcd".to_string()));
        assert_eq!(parse_push_digest("nothing here"), None);
    }

    #[test]
    fn picks_repo_digest_for_repository() {
        let digests = vec!["other/app@sha256:1".to_string(), "reg/app@sha256:2".to_string()];
        assert_eq!(digest_for_repository(&digests, "reg/app"), Some("sha256:2".to_string()));
        assert_eq!(digest_for_repository(&digests, "missing"), None);
    }

    #[test]
    fn classifies_failures() {
        assert!(matches!(
            classify_push_failure("received unexpected HTTP status: 503 Service Unavailable"),
            RegistryError::Transient(_)
        ));
        assert!(matches!(
            classify_push_failure("denied: requested access to the resource is denied"),
            RegistryError::Rejected(_)
        ));
    }

    #[test]
    fn only_a_missing_manifest_means_absent() {
        assert_eq!(classify_manifest_inspect(true, ""), Ok(true));
        assert_eq!(
            classify_manifest_inspect(false, "no such manifest: reg/app@sha256:00"),
            Ok(false)
        );
        assert_eq!(classify_manifest_inspect(false, "manifest unknown: manifest unknown"), Ok(false));
        assert!(matches!(
            classify_manifest_inspect(false, "dial tcp 10.0.0.1:443: i/o timeout"),
            Err(RegistryError::Transient(_))
        ));
        assert!(matches!(
            classify_manifest_inspect(false, "unauthorized: authentication required"),
            Err(RegistryError::Rejected(_))
        ));
    }
}
