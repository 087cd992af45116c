use std::path::Path;
use std::time::Duration;

use rpl_build::{resolve_source, tree_is_clean};
use rpl_core::Image;
use rpl_deploy::{render, template_values};
use rpl_sign::SecretStore;
use rpl_step::run_command;

use crate::{wiring::secret_store, Config};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoctorCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

impl DoctorCheck {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Preflight checks. Every check runs; callers decide what a failure means.
pub async fn doctor(repo_root: &Path, cfg: &Config) -> Vec<DoctorCheck> {
    let mut checks = vec![];

    checks.push(match resolve_source(repo_root).await {
        Ok(src) => DoctorCheck::pass("git", format!("{} @ {}", src.branch, src.commit_id)),
        Err(e) => DoctorCheck::fail("git", e.to_string()),
    });
    checks.push(worktree_check(repo_root).await);

    checks.push(match cfg.validate() {
        Ok(()) => DoctorCheck::pass("config", format!("{} stages", cfg.stage_defs().len())),
        Err(e) => DoctorCheck::fail("config", format!("{e:#}")),
    });

    let mut tools = vec![(cfg.build.program.clone(), vec!["--version".to_string()])];
    if cfg.image.assembler == "docker" || cfg.registry.kind == "docker" {
        tools.push(("docker".to_string(), vec!["--version".to_string()]));
    }
    if cfg.deploy.applier == "kubectl" {
        tools.push(("kubectl".to_string(), vec!["version".to_string(), "--client".to_string()]));
    }
    for s in &cfg.scan.scanners {
        if !tools.iter().any(|(p, _)| *p == s.program) {
            tools.push((s.program.clone(), vec!["--version".to_string()]));
        }
    }
    for (program, args) in tools {
        let name = format!("tool:{program}");
        checks.push(match run_command(repo_root, &program, &args, None, Duration::from_secs(20)).await {
            Ok(out) if out.success() => DoctorCheck::pass(&name, first_line(&out.stdout_str())),
            Ok(out) => DoctorCheck::fail(&name, format!("exited with {:?}", out.exit_code)),
            Err(e) => DoctorCheck::fail(&name, e.to_string()),
        });
    }

    checks.push(signing_check(cfg).await);

    let template_path = cfg.manifest_template_path(repo_root);
    checks.push(match std::fs::read_to_string(&template_path) {
        Ok(template) => {
            let sample = Image {
                repository: cfg.image.repository.clone(),
                tag: "doctor".to_string(),
                digest: format!("sha256:{}", "0".repeat(64)),
            };
            let values = template_values("doctor", &cfg.project.id, &sample, &cfg.deploy.resources);
            match render(&template, &values) {
                Ok(_) => DoctorCheck::pass("manifest", template_path.display().to_string()),
                Err(e) => DoctorCheck::fail("manifest", e.to_string()),
            }
        }
        Err(e) => DoctorCheck::fail("manifest", format!("{}: {e}", template_path.display())),
    });

    checks
}

/// Builds read the working tree, so uncommitted changes would ship under HEAD's commit id.
async fn worktree_check(repo_root: &Path) -> DoctorCheck {
    match tree_is_clean(repo_root).await {
        Ok(true) => DoctorCheck::pass("worktree", "clean"),
        Ok(false) => DoctorCheck::fail("worktree", "uncommitted changes; commit or stash before `rpl run`"),
        Err(e) => DoctorCheck::fail("worktree", e.to_string()),
    }
}

async fn signing_check(cfg: &Config) -> DoctorCheck {
    let configured = match cfg.public_key() {
        Ok(Some(pk)) => pk,
        Ok(None) => return DoctorCheck::fail("signing", "signing.public_key is not set; run `rpl keygen`"),
        Err(e) => return DoctorCheck::fail("signing", format!("{e:#}")),
    };
    let store = match secret_store(cfg) {
        Ok(s) => s,
        Err(e) => return DoctorCheck::fail("signing", format!("{e:#}")),
    };
    match store.signing_key().await {
        Ok(key) if key.public_key() == configured => DoctorCheck::pass("signing", format!("key {}", configured.key_id())),
        Ok(key) => DoctorCheck::fail(
            "signing",
            format!(
                "secret key {} does not match signing.public_key {}",
                key.public_key().key_id(),
                configured.key_id()
            ),
        ),
        Err(e) => DoctorCheck::fail("signing", e.to_string()),
    }
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().to_string()
}
