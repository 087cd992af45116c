use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rpl_core::{BuildArtifact, ImageRef, RunContext};
use rpl_step::run_command;
use tracing::info;

use crate::BuildError;

/// Packages a build artifact into a container image tagged by build id.
#[async_trait]
pub trait ImageAssembler: Send + Sync {
    async fn assemble(&self, ctx: &RunContext, artifact: &BuildArtifact) -> Result<ImageRef, BuildError>;
}

#[derive(Clone, Debug)]
pub struct DockerAssembler {
    pub program: String,
    /// Relative to the source root.
    pub dockerfile: PathBuf,
    pub timeout: Duration,
}

impl DockerAssembler {
    pub fn new(dockerfile: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: "docker".to_string(),
            dockerfile: dockerfile.into(),
            timeout,
        }
    }

    pub fn build_args(&self, ctx: &RunContext, artifact: &BuildArtifact) -> Vec<String> {
        let image = ctx.image_ref();
        let artifact_rel = artifact
            .path
            .strip_prefix(&ctx.source_root)
            .unwrap_or(&artifact.path)
            .display()
            .to_string();
        vec![
            "build".into(),
            "-f".into(),
            self.dockerfile.display().to_string(),
            "-t".into(),
            image.reference(),
            "--build-arg".into(),
            format!("ARTIFACT={artifact_rel}"),
            "--label".into(),
            format!("org.opencontainers.image.revision={}", ctx.commit_id),
            "--label".into(),
            format!("io.rpl.artifact-digest={}", artifact.artifact_digest),
            ".".into(),
        ]
    }
}

#[async_trait]
impl ImageAssembler for DockerAssembler {
    async fn assemble(&self, ctx: &RunContext, artifact: &BuildArtifact) -> Result<ImageRef, BuildError> {
        let args = self.build_args(ctx, artifact);
        let out = run_command(&ctx.source_root, &self.program, &args, None, self.timeout).await?;
        if !out.success() {
            return Err(BuildError::CommandFailed {
                program: self.program.clone(),
                code: out.exit_code,
                stderr: out.stderr_str(),
            });
        }
        let image = ctx.image_ref();
        info!(image = %image.reference(), "image assembled");
        Ok(image)
    }
}

/// For build commands that already produce and tag the image themselves.
#[derive(Clone, Debug, Default)]
pub struct PrebuiltImage;

#[async_trait]
impl ImageAssembler for PrebuiltImage {
    async fn assemble(&self, ctx: &RunContext, _artifact: &BuildArtifact) -> Result<ImageRef, BuildError> {
        Ok(ctx.image_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpl_core::{BuildId, RunId};

    #[test]
    fn docker_args_tag_by_build_id_and_label_provenance() {
        let root = PathBuf::from("/src");
        let ctx = RunContext {
            run_id: RunId::from_str("r"),
            project_id: "p".into(),
            branch: "dev".into(),
            commit_id: "abc".into(),
            build_id: BuildId::from_str("abc-9"),
            repository: "reg.example/p".into(),
            source_root: root.clone(),
            started_at_ms: 0,
        };
        let artifact = BuildArtifact {
            source_commit_id: "abc".into(),
            build_id: BuildId::from_str("abc-9"),
            artifact_digest: "sha256:00".into(),
            path: root.join("target/app.jar"),
        };
        let args = DockerAssembler::new("Dockerfile", Duration::from_secs(1)).build_args(&ctx, &artifact);
        assert!(args.contains(&"reg.example/p:abc-9".to_string()));
        assert!(args.contains(&"ARTIFACT=target/app.jar".to_string()));
        assert!(args.contains(&"org.opencontainers.image.revision=abc".to_string()));
    }
}
