use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rpl_step::{run_command, CommandError};
use tracing::{debug, info};

use crate::{ApplyReceipt, ApplyRequest, ClusterApplier, DeployError};

/// `kubectl apply -n <ns> -f -` with the manifest on stdin.
#[derive(Clone, Debug)]
pub struct KubectlApplier {
    pub program: String,
    /// `--context` to pass, if not the current one.
    pub context: Option<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
}

impl KubectlApplier {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: "kubectl".into(),
            context: None,
            workdir: workdir.into(),
            timeout,
        }
    }

    fn base_args(&self, namespace: &str) -> Vec<String> {
        let mut args = vec![];
        if let Some(ctx) = &self.context {
            args.push("--context".into());
            args.push(ctx.clone());
        }
        args.push("-n".into());
        args.push(namespace.to_string());
        args
    }

    pub fn apply_args(&self, namespace: &str) -> Vec<String> {
        let mut args = vec!["apply".to_string()];
        args.extend(self.base_args(namespace));
        args.extend(["-f".to_string(), "-".to_string()]);
        args
    }

    async fn generation(&self, request: &ApplyRequest) -> Option<u64> {
        let mut args = vec!["get".to_string(), "deployment".to_string(), request.release_name.clone()];
        args.extend(self.base_args(&request.namespace));
        args.extend(["-o".to_string(), "jsonpath={.metadata.generation}".to_string()]);
        match run_command(&self.workdir, &self.program, &args, None, self.timeout).await {
            Ok(out) if out.success() => out.stdout_str().parse().ok(),
            Ok(out) => {
                debug!(stderr = %out.stderr_str(), "generation lookup failed");
                None
            }
            Err(e) => {
                debug!(error = %e, "generation lookup failed");
                None
            }
        }
    }
}

/// Connection-level failures are distinguished from the API server refusing the manifest.
pub fn classify_apply_failure(stderr: &str) -> DeployError {
    let lower = stderr.to_ascii_lowercase();
    let unreachable = [
        "unable to connect to the server",
        "connection refused",
        "i/o timeout",
        "no such host",
        "tls handshake timeout",
    ]
    .iter()
    .any(|needle| lower.contains(needle));
    if unreachable {
        DeployError::Unreachable(stderr.trim().to_string())
    } else if lower.contains("error parsing") || lower.contains("error validating") {
        DeployError::InvalidManifest(stderr.trim().to_string())
    } else {
        DeployError::Rejected(stderr.trim().to_string())
    }
}

/// `kubectl apply` prints one `<kind>/<name> <verb>` line per object;
/// the apply changed something unless every line says `unchanged`.
pub fn apply_changed(stdout: &str) -> bool {
    let lines: Vec<_> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.is_empty() || !lines.iter().all(|l| l.trim_end().ends_with("unchanged"))
}

#[async_trait]
impl ClusterApplier for KubectlApplier {
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyReceipt, DeployError> {
        let args = self.apply_args(&request.namespace);
        let out = run_command(
            &self.workdir,
            &self.program,
            &args,
            Some(request.manifest.as_bytes()),
            self.timeout,
        )
        .await
        .map_err(|e| match e {
            CommandError::TimedOut { .. } => DeployError::Unreachable(e.to_string()),
            other => DeployError::Command(other),
        })?;
        if !out.success() {
            return Err(classify_apply_failure(&out.stderr_str()));
        }
        let changed = apply_changed(&out.stdout_str());
        let revision = self.generation(request).await;
        info!(namespace = %request.namespace, release = %request.release_name, changed, ?revision, "kubectl apply");
        Ok(ApplyReceipt { revision, changed })
    }
}
