use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rpl_core::{DeployStage, RoutingTable, Severity, StageDef};
use rpl_scan::{ReportFormat, ScanGateConfig, TargetKind};
use rpl_sign::PublicKey;
use rpl_step::RetryPolicy;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    pub build: BuildConfig,
    pub image: ImageConfig,
    pub registry: RegistryConfig,
    pub scan: ScanConfig,
    pub signing: SigningConfig,
    pub deploy: DeployConfig,
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    pub artifact_root: String,
    /// Pushes to other branches do not trigger a run.
    pub watched_branches: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub artifact_path: String,
    /// Overrides `timeouts.step_secs` for the build step.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageConfig {
    pub repository: String,
    pub dockerfile: String,
    /// "docker" | "none"
    pub assembler: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// "docker" | "memory"
    pub kind: String,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    pub severity_threshold: Severity,
    pub fail_on_threshold: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    #[serde(default)]
    pub scanners: Vec<ScannerConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub name: String,
    pub target: TargetKind,
    pub program: String,
    pub args: Vec<String>,
    pub format: ReportFormat,
    /// Non-zero exit code that still carries a report (e.g. `trivy --exit-code 1`).
    #[serde(default)]
    pub findings_exit_code: Option<i32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    /// "env:VAR" or "file:/path"; the seed never lives in this file.
    pub secret: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployConfig {
    /// "kubectl" | "file" | "memory"
    pub applier: String,
    pub manifest_template: String,
    #[serde(default)]
    pub kube_context: Option<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    pub step_secs: u64,
}

/// Unset fields fall back to the conventional stage layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageConfig {
    pub stage: DeployStage,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default)]
    pub approval_required: Option<bool>,
}

impl Config {
    pub fn default_for_repo(project_id: &str) -> Self {
        let trivy = |target: TargetKind, sub: &str| ScannerConfig {
            name: format!("trivy-{sub}"),
            target,
            program: "trivy".to_string(),
            args: vec![
                sub.to_string(),
                "--format".to_string(),
                "json".to_string(),
                "--quiet".to_string(),
                "{target}".to_string(),
            ],
            format: ReportFormat::Trivy,
            findings_exit_code: None,
        };
        Self {
            project: ProjectConfig {
                id: project_id.to_string(),
                artifact_root: "~/.rpl/artifacts".to_string(),
                watched_branches: ["main", "dev", "staging", "prod"].iter().map(|s| s.to_string()).collect(),
            },
            build: BuildConfig {
                program: "mvn".to_string(),
                args: vec!["-B".to_string(), "package".to_string(), "-DskipTests".to_string()],
                artifact_path: "target/app.jar".to_string(),
                timeout_secs: None,
            },
            image: ImageConfig {
                repository: format!("registry.example.com/{project_id}"),
                dockerfile: "Dockerfile".to_string(),
                assembler: "docker".to_string(),
            },
            registry: RegistryConfig {
                kind: "docker".to_string(),
                max_attempts: 3,
                base_delay_ms: 2000,
            },
            scan: ScanConfig {
                severity_threshold: Severity::High,
                fail_on_threshold: true,
                max_attempts: 3,
                base_delay_ms: 2000,
                scanners: vec![trivy(TargetKind::Source, "fs"), trivy(TargetKind::Image, "image")],
            },
            signing: SigningConfig {
                secret: "env:RPL_SIGNING_KEY".to_string(),
                public_key: None,
            },
            deploy: DeployConfig {
                applier: "kubectl".to_string(),
                manifest_template: ".rpl/manifest.yaml.tmpl".to_string(),
                kube_context: None,
                resources: BTreeMap::from([
                    ("cpu".to_string(), "500m".to_string()),
                    ("memory".to_string(), "512Mi".to_string()),
                ]),
            },
            timeouts: TimeoutsConfig { step_secs: 1800 },
            stages: DeployStage::CHAIN
                .iter()
                .map(|s| StageConfig {
                    stage: *s,
                    branch: None,
                    namespace: None,
                    release_name: None,
                    approval_required: None,
                })
                .collect(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse rpl.toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.id.trim().is_empty() {
            return Err(anyhow!("project.id must not be empty"));
        }
        if self.image.repository.trim().is_empty() {
            return Err(anyhow!("image.repository must not be empty"));
        }
        let mut seen = vec![];
        for s in &self.stages {
            if seen.contains(&s.stage) {
                return Err(anyhow!("stage {} is configured twice", s.stage));
            }
            seen.push(s.stage);
        }
        self.routing()?;
        self.public_key()?;
        Ok(())
    }

    /// Stage definitions in promotion order. A stage depends on the closest
    /// configured stage before it in the chain.
    pub fn stage_defs(&self) -> Vec<StageDef> {
        let mut configured: Vec<&StageConfig> = self.stages.iter().collect();
        configured.sort_by_key(|s| s.stage);
        let mut prev = None;
        configured
            .into_iter()
            .map(|s| {
                let mut def = StageDef::conventional(s.stage, &self.project.id);
                def.depends_on = prev;
                if let Some(b) = &s.branch {
                    def.branch_filter = b.clone();
                }
                if let Some(ns) = &s.namespace {
                    def.namespace = ns.clone();
                }
                if let Some(r) = &s.release_name {
                    def.release_name = r.clone();
                }
                if let Some(a) = s.approval_required {
                    def.approval_required = a;
                }
                prev = Some(s.stage);
                def
            })
            .collect()
    }

    pub fn routing(&self) -> Result<RoutingTable> {
        RoutingTable::from_stages(&self.stage_defs()).map_err(|e| anyhow!(e))
    }

    pub fn public_key(&self) -> Result<Option<PublicKey>> {
        self.signing
            .public_key
            .as_deref()
            .map(|hex| PublicKey::from_hex(hex).map_err(|e| anyhow!("signing.public_key: {e}")))
            .transpose()
    }

    pub fn scan_gate_config(&self) -> ScanGateConfig {
        ScanGateConfig {
            severity_threshold: self.scan.severity_threshold,
            fail_on_threshold: self.scan.fail_on_threshold,
            retry: RetryPolicy::new(self.scan.max_attempts, Duration::from_millis(self.scan.base_delay_ms)),
        }
    }

    pub fn registry_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.registry.max_attempts, Duration::from_millis(self.registry.base_delay_ms))
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.step_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build.timeout_secs.unwrap_or(self.timeouts.step_secs))
    }

    pub fn artifact_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.project.artifact_root).to_string())
    }

    pub fn manifest_template_path(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.deploy.manifest_template)
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".rpl").join("rpl.toml")
    }

    pub fn db_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".rpl").join("rpl.db")
    }

    pub fn approvals_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".rpl").join("approvals")
    }

    pub fn cluster_dir(repo_root: &Path) -> PathBuf {
        repo_root.join(".rpl").join("cluster")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = Config::config_path(dir.path());
        let cfg = Config::default_for_repo("shop");
        cfg.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.project.id, "shop");
        assert_eq!(loaded.scan.severity_threshold, Severity::High);
        assert_eq!(loaded.scan.scanners.len(), 2);
        assert_eq!(loaded.stage_defs().len(), 3);
    }

    #[test]
    fn stage_defs_follow_configured_chain() {
        let mut cfg = Config::default_for_repo("shop");
        cfg.stages.retain(|s| s.stage != DeployStage::Staging);
        cfg.stages[1].namespace = Some("production".into());
        let defs = cfg.stage_defs();
        assert_eq!(defs[0].stage, DeployStage::Dev);
        assert_eq!(defs[1].stage, DeployStage::Prod);
        assert_eq!(defs[1].depends_on, Some(DeployStage::Dev));
        assert_eq!(defs[1].namespace, "production");
        assert_eq!(defs[1].release_name, "shop");
        assert!(defs[1].approval_required);
    }

    #[test]
    fn conflicting_branches_are_rejected() {
        let mut cfg = Config::default_for_repo("shop");
        cfg.stages[1].branch = Some("dev".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
[project]
id = "svc"
artifact_root = "/tmp/rpl"
watched_branches = ["main", "dev"]

[build]
program = "cargo"
args = ["build", "--release"]
artifact_path = "target/release/svc"

[image]
repository = "ghcr.io/acme/svc"
dockerfile = "Dockerfile"
assembler = "none"

[registry]
kind = "memory"
max_attempts = 5
base_delay_ms = 100

[scan]
severity_threshold = "critical"
fail_on_threshold = false
max_attempts = 2
base_delay_ms = 10

[signing]
secret = "file:/run/secrets/rpl"

[deploy]
applier = "file"
manifest_template = "deploy/app.yaml.tmpl"

[timeouts]
step_secs = 60

[[stages]]
stage = "dev"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.scan.severity_threshold, Severity::Critical);
        assert!(cfg.scan.scanners.is_empty());
        assert_eq!(cfg.registry_retry().max_attempts, 5);
        assert_eq!(cfg.build_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.stage_defs()[0].namespace, "dev");
        assert!(cfg.public_key().unwrap().is_none());
    }
}
