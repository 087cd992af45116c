use std::path::Path;
use std::time::Duration;

use rpl_step::run_command;

use crate::BuildError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub commit_id: String,
    pub branch: String,
}

async fn git(repo: &Path, args: &[&str]) -> Result<String, BuildError> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let out = run_command(repo, "git", &args, None, Duration::from_secs(30)).await?;
    if !out.success() {
        return Err(BuildError::Source(format!("git {:?} failed: {}", args, out.stderr_str())));
    }
    Ok(out.stdout_str())
}

/// Read the checked-out commit and branch of the source tree.
pub async fn resolve_source(repo_root: &Path) -> Result<SourceInfo, BuildError> {
    let commit_id = git(repo_root, &["rev-parse", "HEAD"]).await?;
    let branch = git(repo_root, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    Ok(SourceInfo { commit_id, branch })
}

pub async fn tree_is_clean(repo_root: &Path) -> Result<bool, BuildError> {
    Ok(git(repo_root, &["status", "--porcelain"]).await?.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_git_repo(dir: &Path) -> bool {
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        };
        run(&["init", "-b", "dev"])
            && run(&["config", "user.email", "rpl@example.com"])
            && run(&["config", "user.name", "rpl"])
            && std::fs::write(dir.join("README.md"), "fixture").is_ok()
            && run(&["add", "."])
            && run(&["commit", "-m", "init"])
    }

    #[tokio::test]
    async fn resolves_commit_and_branch() {
        let dir = tempfile::tempdir().unwrap();
        if !init_git_repo(dir.path()) {
            // git unavailable in this environment
            return;
        }
        let info = resolve_source(dir.path()).await.unwrap();
        assert_eq!(info.branch, "dev");
        assert_eq!(info.commit_id.len(), 40);
        assert!(tree_is_clean(dir.path()).await.unwrap());
    }
}
