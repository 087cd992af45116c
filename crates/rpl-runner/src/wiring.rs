use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rpl_approval::FileApprovals;
use rpl_artifacts::FsArtifactStore;
use rpl_build::{ArtifactBuilder, CommandBuilder, DockerAssembler, ImageAssembler, PrebuiltImage};
use rpl_deploy::{
    ClusterApplier, DeploymentExecutor, FileCluster, InMemoryCluster, KubectlApplier, DEFAULT_MANIFEST_TEMPLATE,
};
use rpl_registry::{DockerRegistry, InMemoryRegistry, Registry};
use rpl_scan::{CommandScanner, ScanGate, Scanner};
use rpl_sign::{secret_store_from_ref, SecretStore, SigningService};
use rpl_step::LockRegistry;
use rpl_storage::RecordStore;
use rpl_storage_sqlite::SqliteStore;

use crate::{Capabilities, Config, PipelineSettings, PromotionPipeline};

pub fn settings_from_config(cfg: &Config) -> Result<PipelineSettings> {
    Ok(PipelineSettings {
        project_id: cfg.project.id.clone(),
        repository: cfg.image.repository.clone(),
        watched_branches: cfg.project.watched_branches.clone(),
        stages: cfg.stage_defs(),
        routing: cfg.routing()?,
        public_key: cfg.public_key()?,
        registry_retry: cfg.registry_retry(),
        build_timeout: cfg.build_timeout(),
        step_timeout: cfg.step_timeout(),
    })
}

pub fn registry_from_config(repo_root: &Path, cfg: &Config) -> Result<Arc<dyn Registry>> {
    match cfg.registry.kind.as_str() {
        "docker" => Ok(Arc::new(DockerRegistry::new(repo_root.to_path_buf(), cfg.step_timeout()))),
        "memory" => Ok(Arc::new(InMemoryRegistry::new())),
        other => Err(anyhow!("unknown registry.kind {other:?} (expected docker or memory)")),
    }
}

pub fn applier_from_config(repo_root: &Path, cfg: &Config) -> Result<Arc<dyn ClusterApplier>> {
    match cfg.deploy.applier.as_str() {
        "kubectl" => {
            let mut k = KubectlApplier::new(repo_root, cfg.step_timeout());
            k.context = cfg.deploy.kube_context.clone();
            Ok(Arc::new(k))
        }
        "file" => Ok(Arc::new(FileCluster::new(Config::cluster_dir(repo_root)))),
        "memory" => Ok(Arc::new(InMemoryCluster::new())),
        other => Err(anyhow!("unknown deploy.applier {other:?} (expected kubectl, file or memory)")),
    }
}

pub fn scanners_from_config(repo_root: &Path, cfg: &Config) -> Vec<Arc<dyn Scanner>> {
    cfg.scan
        .scanners
        .iter()
        .map(|s| {
            Arc::new(CommandScanner {
                name: s.name.clone(),
                kind: s.target,
                program: s.program.clone(),
                args: s.args.clone(),
                format: s.format,
                workdir: repo_root.to_path_buf(),
                timeout: cfg.step_timeout(),
                findings_exit_code: s.findings_exit_code,
            }) as Arc<dyn Scanner>
        })
        .collect()
}

pub fn secret_store(cfg: &Config) -> Result<Arc<dyn SecretStore>> {
    let store = secret_store_from_ref(&cfg.signing.secret).map_err(|e| anyhow!("signing.secret: {e}"))?;
    Ok(Arc::from(store))
}

/// Wire a pipeline from `.rpl/rpl.toml` against real tools and the SQLite store.
pub fn pipeline_from_config(repo_root: &Path, cfg: &Config) -> Result<PromotionPipeline> {
    let store = Arc::new(SqliteStore::open(&Config::db_path(repo_root))?);
    // Leases live in the shared database so concurrent `rpl` processes exclude each other.
    // A lease outlives the longest locked step, so only a crashed holder ever lets one expire.
    let locks = Arc::new(LockRegistry::with_leases(store.clone(), cfg.step_timeout() * 2));
    let records: Arc<dyn RecordStore> = store;

    let builder: Arc<dyn ArtifactBuilder> = Arc::new(CommandBuilder {
        program: cfg.build.program.clone(),
        args: cfg.build.args.clone(),
        artifact_path: PathBuf::from(&cfg.build.artifact_path),
        timeout: cfg.build_timeout(),
    });
    let assembler: Arc<dyn ImageAssembler> = match cfg.image.assembler.as_str() {
        "docker" => Arc::new(DockerAssembler::new(&cfg.image.dockerfile, cfg.build_timeout())),
        "none" => Arc::new(PrebuiltImage),
        other => return Err(anyhow!("unknown image.assembler {other:?} (expected docker or none)")),
    };

    let registry = registry_from_config(repo_root, cfg)?;
    let signer = Arc::new(SigningService::new(secret_store(cfg)?, registry.clone()));

    let template_path = cfg.manifest_template_path(repo_root);
    let template = std::fs::read_to_string(&template_path)
        .with_context(|| format!("read manifest template {}", template_path.display()))?;
    let executor = Arc::new(DeploymentExecutor::new(
        applier_from_config(repo_root, cfg)?,
        records.clone(),
        locks.clone(),
        template,
        cfg.deploy.resources.clone(),
    ));

    let caps = Capabilities {
        builder,
        assembler,
        scan_gate: Arc::new(ScanGate::new(scanners_from_config(repo_root, cfg), cfg.scan_gate_config())),
        registry,
        signer,
        approvals: Arc::new(FileApprovals::new(Config::approvals_dir(repo_root))),
        executor,
        records,
        artifacts: Arc::new(FsArtifactStore::new(cfg.artifact_root())),
        locks,
    };
    Ok(PromotionPipeline::new(caps, settings_from_config(cfg)?))
}

/// Create `.rpl/` with default config, manifest template, approvals dir and database.
/// Existing files are left alone.
pub fn init_repo(repo_root: &Path) -> Result<Config> {
    std::fs::create_dir_all(Config::approvals_dir(repo_root))
        .with_context(|| format!("create {}", Config::approvals_dir(repo_root).display()))?;
    let cfg_path = Config::config_path(repo_root);
    let cfg = if cfg_path.exists() {
        Config::load_from(&cfg_path)?
    } else {
        let project_id = repo_root.file_name().and_then(|s| s.to_str()).unwrap_or("app");
        let cfg = Config::default_for_repo(project_id);
        cfg.save_to(&cfg_path)?;
        cfg
    };
    let template_path = cfg.manifest_template_path(repo_root);
    if !template_path.exists() {
        if let Some(parent) = template_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&template_path, DEFAULT_MANIFEST_TEMPLATE)
            .with_context(|| format!("write {}", template_path.display()))?;
    }
    SqliteStore::open(&Config::db_path(repo_root))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_wire_with_file_applier() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let mut cfg = init_repo(root).unwrap();
        assert!(Config::db_path(root).exists());
        assert!(cfg.manifest_template_path(root).exists());

        cfg.deploy.applier = "file".into();
        cfg.registry.kind = "memory".into();
        cfg.project.artifact_root = root.join("artifacts").display().to_string();
        let pipeline = pipeline_from_config(root, &cfg).unwrap();
        assert_eq!(pipeline.settings().stages.len(), 3);
        assert!(pipeline.settings().public_key.is_none());

        // Second init keeps the edited config.
        cfg.save_to(&Config::config_path(root)).unwrap();
        let again = init_repo(root).unwrap();
        assert_eq!(again.deploy.applier, "file");
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default_for_repo("x");
        cfg.registry.kind = "quay".into();
        assert!(registry_from_config(dir.path(), &cfg).is_err());
        cfg.deploy.applier = "helm".into();
        assert!(applier_from_config(dir.path(), &cfg).is_err());
    }
}
