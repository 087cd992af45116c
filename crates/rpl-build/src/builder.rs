use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rpl_core::{BuildArtifact, RunContext};
use rpl_step::{expand_args, run_command};
use tracing::info;

use crate::{file_digest, BuildError};

/// Compiles/packages a source tree into a content-addressed artifact.
/// Build failures are never retried; the operator has to change the source.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, ctx: &RunContext) -> Result<BuildArtifact, BuildError>;
}

/// Runs an external packager (`mvn package`, `cargo build`, ...) in the source tree.
#[derive(Clone, Debug)]
pub struct CommandBuilder {
    pub program: String,
    /// Supports `{commit}` and `{build_id}` placeholders.
    pub args: Vec<String>,
    /// Relative to the source root.
    pub artifact_path: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl ArtifactBuilder for CommandBuilder {
    async fn build(&self, ctx: &RunContext) -> Result<BuildArtifact, BuildError> {
        let args = expand_args(
            &self.args,
            &[("commit", ctx.commit_id.as_str()), ("build_id", ctx.build_id.as_str())],
        );
        let out = run_command(&ctx.source_root, &self.program, &args, None, self.timeout).await?;
        if !out.success() {
            return Err(BuildError::CommandFailed {
                program: self.program.clone(),
                code: out.exit_code,
                stderr: tail(&out.stderr_str(), 2000),
            });
        }

        let path = ctx.source_root.join(&self.artifact_path);
        if !path.is_file() {
            return Err(BuildError::MissingArtifact(path.display().to_string()));
        }
        let artifact_digest = file_digest(&path).await?;
        info!(build_id = %ctx.build_id, digest = %artifact_digest, "artifact built");

        Ok(BuildArtifact {
            source_commit_id: ctx.commit_id.clone(),
            build_id: ctx.build_id.clone(),
            artifact_digest,
            path,
        })
    }
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpl_core::{BuildId, RunId};

    fn ctx(root: &std::path::Path) -> RunContext {
        RunContext {
            run_id: RunId::from_str("r1"),
            project_id: "p".into(),
            branch: "dev".into(),
            commit_id: "c0ffee".into(),
            build_id: BuildId::from_str("c0ffee-1"),
            repository: "reg/p".into(),
            source_root: root.to_path_buf(),
            started_at_ms: 0,
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn builds_and_digests_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CommandBuilder {
            program: "sh".into(),
            args: vec!["-c".into(), "mkdir -p target && printf '{build_id}' > target/app.jar".into()],
            artifact_path: PathBuf::from("target/app.jar"),
            timeout: Duration::from_secs(10),
        };
        let artifact = builder.build(&ctx(dir.path())).await.unwrap();
        assert_eq!(artifact.source_commit_id, "c0ffee");
        assert_eq!(artifact.artifact_digest, crate::sha256_digest(b"c0ffee-1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn compile_failure_is_a_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CommandBuilder {
            program: "sh".into(),
            args: vec!["-c".into(), "echo 'cannot find symbol' >&2; exit 1".into()],
            artifact_path: PathBuf::from("target/app.jar"),
            timeout: Duration::from_secs(10),
        };
        let err = builder.build(&ctx(dir.path())).await.unwrap_err();
        match err {
            BuildError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("cannot find symbol"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_artifact_fails() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CommandBuilder {
            program: "true".into(),
            args: vec![],
            artifact_path: PathBuf::from("target/app.jar"),
            timeout: Duration::from_secs(10),
        };
        assert!(matches!(
            builder.build(&ctx(dir.path())).await,
            Err(BuildError::MissingArtifact(_))
        ));
    }

    #[test]
    fn tail_keeps_end_of_output() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
