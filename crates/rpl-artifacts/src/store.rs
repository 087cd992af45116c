use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rpl_core::RunId;

use crate::manifest::{EvidenceKind, ProvenanceManifest};

/// Per-run provenance directory: `<root>/<project>/<run_id>/`.
pub trait ArtifactStore: Send + Sync {
    fn create_run_dir(&self, project_id: &str, run_id: &RunId) -> Result<PathBuf>;
    fn write_provenance(&self, run_dir: &Path, manifest: &ProvenanceManifest) -> Result<()>;
    fn append_worklog(&self, run_dir: &Path, line: &str) -> Result<()>;
    fn write_evidence(&self, run_dir: &Path, kind: EvidenceKind, name: &str, bytes: &[u8]) -> Result<PathBuf>;
}

#[derive(Clone)]
pub struct FsArtifactStore {
    pub root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn run_dir(&self, project_id: &str, run_id: &RunId) -> PathBuf {
        self.root.join(project_id).join(run_id.as_str())
    }

    fn kind_dir(kind: EvidenceKind) -> &'static str {
        match kind {
            EvidenceKind::ScanReport => "scan",
            EvidenceKind::DeployManifest => "deploy",
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn create_run_dir(&self, project_id: &str, run_id: &RunId) -> Result<PathBuf> {
        let dir = self.run_dir(project_id, run_id);
        std::fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        Ok(dir)
    }

    fn write_provenance(&self, run_dir: &Path, manifest: &ProvenanceManifest) -> Result<()> {
        let path = run_dir.join("provenance.json");
        let tmp = run_dir.join("provenance.json.tmp");
        let bytes = serde_json::to_vec_pretty(manifest)?;
        // Readers never see a half-written manifest.
        std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("write provenance {}", path.display()))?;
        Ok(())
    }

    fn append_worklog(&self, run_dir: &Path, line: &str) -> Result<()> {
        let path = run_dir.join("worklog.md");
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open worklog {}", path.display()))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    fn write_evidence(&self, run_dir: &Path, kind: EvidenceKind, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = run_dir.join(Self::kind_dir(kind));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, bytes).with_context(|| format!("write evidence {}", path.display()))?;
        Ok(path)
    }
}
