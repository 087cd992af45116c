use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rpl_core::{DeployOutcome, DeployStage, ImageRef, RunId, RunRecord, RunState};
use rpl_registry::Registry;
use rpl_runner::{doctor, init_repo, pipeline_from_config, registry_from_config, CancelHandle, Config, RunRequest};
use rpl_sign::{ensure_verified, generate_keypair};
use rpl_storage::RecordStore;

#[derive(Parser)]
#[command(name = "rpl", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize rpl in the current repo (creates .rpl/, config, manifest template, db)
    Init,

    /// Check tools, signing keys and the manifest template
    Doctor,

    /// Build, scan, push, sign and deploy a commit
    Run {
        /// Defaults to the checked-out branch
        #[arg(long)]
        branch: Option<String>,
        /// Defaults to HEAD
        #[arg(long)]
        commit: Option<String>,
    },

    /// Approve a stage for a run halted at its approval gate
    Approve {
        #[arg(long)]
        run: String,
        #[arg(long)]
        stage: String,
        #[arg(long)]
        by: String,
    },

    /// Continue a run halted at an approval gate
    Resume {
        #[arg(long)]
        run: String,
    },

    /// Cancel a run that is halted at an approval gate
    Cancel {
        #[arg(long)]
        run: String,
    },

    /// Show one run
    Status {
        #[arg(long)]
        run: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List recent runs, newest first
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show the deployment log of a namespace, oldest first
    Deployments {
        #[arg(long)]
        namespace: String,
    },

    /// Generate an Ed25519 signing key
    Keygen {
        /// Write the private seed here instead of printing it
        #[arg(long)]
        out: Option<PathBuf>,
        /// Store the public key (and the seed file, with --out) in .rpl/rpl.toml
        #[arg(long, default_value_t = false)]
        save: bool,
    },

    /// Re-verify a run's image signature against the configured public key and
    /// check that its tag still resolves to the signed digest
    Verify {
        #[arg(long)]
        run: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let repo_root = std::env::current_dir()?;

    match cli.cmd {
        Command::Init => {
            init_repo(&repo_root)?;
            println!("Initialized rpl in {}", repo_root.display());
        }
        Command::Doctor => {
            let cfg = load_config(&repo_root)?;
            let checks = doctor(&repo_root, &cfg).await;
            let mut failed = 0;
            for check in &checks {
                let mark = if check.ok { "ok  " } else { "FAIL" };
                println!("{mark} {:<10} {}", check.name, check.detail);
                if !check.ok {
                    failed += 1;
                }
            }
            if failed > 0 {
                bail!("{failed} doctor check(s) failed");
            }
            println!("OK");
        }
        Command::Run { branch, commit } => {
            let cfg = load_config(&repo_root)?;
            let pipeline = pipeline_from_config(&repo_root, &cfg)?;
            let (branch, commit_id) = match (branch, commit) {
                (Some(b), Some(c)) => (b, c),
                (branch, commit) => {
                    let src = rpl_build::resolve_source(&repo_root).await?;
                    (branch.unwrap_or(src.branch), commit.unwrap_or(src.commit_id))
                }
            };
            let cancel = cancel_on_ctrl_c();
            let record = pipeline
                .run(
                    RunRequest {
                        branch,
                        commit_id,
                        source_root: repo_root.clone(),
                        build_id: None,
                    },
                    &cancel,
                )
                .await?;
            report(&record)?;
        }
        Command::Approve { run, stage, by } => {
            let cfg = load_config(&repo_root)?;
            let pipeline = pipeline_from_config(&repo_root, &cfg)?;
            let stage = DeployStage::parse(&stage).ok_or_else(|| anyhow!("unknown stage {stage:?}"))?;
            let approval = pipeline.approve(&RunId::from_str(run.clone()), stage, &by).await?;
            println!("Approved {} for run {} by {}", approval.stage, run, approval.approved_by);
            println!("Continue with: rpl resume --run {run}");
        }
        Command::Resume { run } => {
            let cfg = load_config(&repo_root)?;
            let pipeline = pipeline_from_config(&repo_root, &cfg)?;
            let cancel = cancel_on_ctrl_c();
            let record = pipeline.resume(&RunId::from_str(run), &cancel).await?;
            report(&record)?;
        }
        Command::Cancel { run } => {
            let cfg = load_config(&repo_root)?;
            let pipeline = pipeline_from_config(&repo_root, &cfg)?;
            let record = pipeline.cancel_run(&RunId::from_str(run))?;
            print_record(&record);
        }
        Command::Status { run, json } => {
            let cfg = load_config(&repo_root)?;
            let pipeline = pipeline_from_config(&repo_root, &cfg)?;
            let record = pipeline
                .records()
                .load_run(&RunId::from_str(run.clone()))?
                .ok_or_else(|| anyhow!("run {run} not found"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }
        Command::History { limit } => {
            let cfg = load_config(&repo_root)?;
            let pipeline = pipeline_from_config(&repo_root, &cfg)?;
            let runs = pipeline.records().list_runs(limit)?;
            println!("Runs: {}", runs.len());
            for r in runs {
                println!(
                    "- {} [{}] {} {}",
                    r.run_id(),
                    r.state,
                    r.context.branch,
                    r.image.as_ref().map(|i| i.pinned_reference()).unwrap_or_default()
                );
            }
        }
        Command::Deployments { namespace } => {
            let cfg = load_config(&repo_root)?;
            let pipeline = pipeline_from_config(&repo_root, &cfg)?;
            let records = pipeline.records().deployments_for(&namespace)?;
            println!("Deployments to {namespace}: {}", records.len());
            for d in records {
                let outcome = match d.outcome {
                    DeployOutcome::Succeeded => "ok",
                    DeployOutcome::Failed => "FAILED",
                };
                println!(
                    "- {} [{outcome}] {} {} run {}{}",
                    d.id,
                    d.release_name,
                    d.image.pinned_reference(),
                    d.run_id,
                    d.error.map(|e| format!(": {e}")).unwrap_or_default()
                );
            }
        }
        Command::Keygen { out, save } => {
            let (key, public) = generate_keypair();
            match &out {
                Some(path) => {
                    write_secret(path, &key.to_hex())?;
                    println!("Wrote signing seed to {}", path.display());
                }
                None => println!("seed:       {}", key.to_hex()),
            }
            println!("public key: {}", public.to_hex());
            println!("key id:     {}", public.key_id());
            if save {
                let cfg_path = Config::config_path(&repo_root);
                let mut cfg = Config::load_from(&cfg_path)?;
                cfg.signing.public_key = Some(public.to_hex());
                if let Some(path) = &out {
                    let abs = std::fs::canonicalize(path)?;
                    cfg.signing.secret = format!("file:{}", abs.display());
                }
                cfg.save_to(&cfg_path)?;
                println!("Saved to {}", cfg_path.display());
            }
        }
        Command::Verify { run } => {
            let cfg = load_config(&repo_root)?;
            let key = cfg
                .public_key()?
                .ok_or_else(|| anyhow!("signing.public_key is not set in {}", Config::config_path(&repo_root).display()))?;
            let pipeline = pipeline_from_config(&repo_root, &cfg)?;
            let record = pipeline
                .records()
                .load_run(&RunId::from_str(run.clone()))?
                .ok_or_else(|| anyhow!("run {run} not found"))?;
            let (Some(image), Some(sig)) = (&record.image, &record.signature) else {
                bail!("run {run} has no signed image");
            };
            ensure_verified(&image.digest, sig, &key)?;
            println!("Verified {} signed by {}", image.pinned_reference(), sig.signer_key_id);

            let registry = registry_from_config(&repo_root, &cfg)?;
            let tag = ImageRef {
                repository: image.repository.clone(),
                tag: image.tag.clone(),
            };
            match registry.resolve(&tag).await? {
                Some(current) if current.digest == image.digest => {
                    println!("Tag {} still points at the signed digest", tag.reference())
                }
                Some(current) => bail!(
                    "tag {} now points at {}, not the signed {}",
                    tag.reference(),
                    current.digest,
                    image.digest
                ),
                None => println!("Tag {} is not known to the registry; only the digest was checked", tag.reference()),
            }
        }
    }

    Ok(())
}

fn load_config(repo_root: &Path) -> anyhow::Result<Config> {
    let path = Config::config_path(repo_root);
    Config::load_from(&path).with_context(|| format!("load {} (run `rpl init` first)", path.display()))
}

/// First Ctrl-C cancels the run at the next step boundary.
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("cancellation requested");
            handle.cancel();
        }
    });
    cancel
}

fn write_secret(path: &Path, contents: &str) -> anyhow::Result<()> {
    use std::io::Write;
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts.open(path).with_context(|| format!("create {}", path.display()))?;
    writeln!(f, "{contents}")?;
    Ok(())
}

fn report(record: &RunRecord) -> anyhow::Result<()> {
    print_record(record);
    match record.state {
        RunState::Failed => bail!("run {} failed", record.run_id()),
        RunState::Cancelled => bail!("run {} cancelled", record.run_id()),
        RunState::Pending => {
            if let Some(stage) = record.halted_at {
                println!();
                println!("Waiting for approval of {stage}:");
                println!("  rpl approve --run {} --stage {stage} --by <you>", record.run_id());
                println!("  rpl resume --run {}", record.run_id());
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn print_record(record: &RunRecord) {
    println!("Run {} [{}]", record.run_id(), record.state);
    println!("  branch {} commit {}", record.context.branch, record.context.commit_id);
    if let Some(image) = &record.image {
        println!("  image  {}", image.pinned_reference());
    }
    if let Some(sig) = &record.signature {
        println!("  signed by {}", sig.signer_key_id);
    }
    for scan in &record.scans {
        let verdict = if scan.passed { "passed" } else { "FAILED" };
        println!("  scan {} {verdict} ({} findings)", scan.target.describe(), scan.findings.len());
    }
    for s in &record.stages {
        println!("  {} {:?} {}", s.stage, s.status, s.detail.as_deref().unwrap_or(""));
    }
    if let Some(err) = &record.error {
        println!("  error: {err}");
    }
}
