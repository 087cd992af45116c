use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },
    #[error("io error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Run an external program (no shell) under a hard timeout.
/// The child is killed if the timeout elapses.
pub async fn run_command(
    dir: &Path,
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    debug!(program, ?args, dir = %dir.display(), "exec");

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(dir)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    // Feed stdin while collecting output, both under the timeout: a child that never
    // reads its input must not hold the step past its deadline.
    let feed = child.stdin.take().zip(stdin);
    let run = async move {
        let write = async {
            if let Some((mut pipe, bytes)) = feed {
                match pipe.write_all(bytes).await {
                    // The child may exit without reading all of its input.
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
                // Dropping the pipe closes stdin so the child sees EOF.
            }
            Ok(())
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        written?;
        output
    };

    let output = match tokio::time::timeout(timeout, run).await {
        Ok(res) => res.map_err(|source| CommandError::Io {
            program: program.to_string(),
            source,
        })?,
        Err(_) => {
            return Err(CommandError::TimedOut {
                program: program.to_string(),
                secs: timeout.as_secs(),
            })
        }
    };

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Substitute `{name}` placeholders in argument templates.
pub fn expand_args(args: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    args.iter()
        .map(|a| {
            vars.iter()
                .fold(a.clone(), |acc, (k, v)| acc.replace(&format!("{{{k}}}"), v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_placeholders() {
        let args = vec!["image".to_string(), "{target}".to_string(), "--tag={tag}".to_string()];
        let out = expand_args(&args, &[("target", "repo:1"), ("tag", "1")]);
        assert_eq!(out, vec!["image", "repo:1", "--tag=1"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command(dir.path(), "sh", &["-c".into(), "echo hi; exit 3".into()], None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout_str(), "hi");
        assert!(!out.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_command(dir.path(), "cat", &[], Some(b"manifest"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_str(), "manifest");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kills_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command(dir.path(), "sleep", &["5".into()], None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_ignoring_stdin_still_times_out() {
        let dir = tempfile::tempdir().unwrap();
        // Far larger than a pipe buffer, so the write blocks until the child reads.
        let input = vec![b'x'; 1 << 20];
        let started = std::time::Instant::now();
        let err = run_command(
            dir.path(),
            "sh",
            &["-c".into(), "sleep 5".into()],
            Some(&input),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_command(dir.path(), "rpl-definitely-not-installed", &[], None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
