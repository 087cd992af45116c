use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rpl_approval::{format_approval_request, ApprovalGate, ApprovalRecord};
use rpl_artifacts::{ArtifactStore, EvidenceKind, ProvenanceManifest};
use rpl_build::{ArtifactBuilder, ImageAssembler};
use rpl_core::{
    evaluate_gate, now_ms, now_unix, transition, BuildId, DeployOutcome, DeployStage, GateDecision, PipelineError,
    RoutingTable, RunContext, RunEvent, RunId, RunRecord, RunState, ScanTarget, StageDef, StageOutcome, StageStatus,
};
use rpl_deploy::DeploymentExecutor;
use rpl_registry::{push_with_retry, Registry};
use rpl_scan::{report_json, ScanGate};
use rpl_sign::{PublicKey, Signer};
use rpl_step::{within, LockRegistry, RetryPolicy};
use rpl_storage::RecordStore;
use tracing::{info, warn};

use crate::CancelHandle;

/// Everything the pipeline talks to, behind capability traits.
pub struct Capabilities {
    pub builder: Arc<dyn ArtifactBuilder>,
    pub assembler: Arc<dyn ImageAssembler>,
    pub scan_gate: Arc<ScanGate>,
    pub registry: Arc<dyn Registry>,
    pub signer: Arc<dyn Signer>,
    pub approvals: Arc<dyn ApprovalGate>,
    pub executor: Arc<DeploymentExecutor>,
    pub records: Arc<dyn RecordStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub locks: Arc<LockRegistry>,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub project_id: String,
    pub repository: String,
    pub watched_branches: Vec<String>,
    /// In promotion order.
    pub stages: Vec<StageDef>,
    pub routing: RoutingTable,
    /// Verification key for the deploy gate. Without it no stage can deploy.
    pub public_key: Option<PublicKey>,
    pub registry_retry: RetryPolicy,
    pub build_timeout: Duration,
    pub step_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub branch: String,
    pub commit_id: String,
    pub source_root: PathBuf,
    /// Defaults to `<short-commit>-<unix-seconds>`.
    pub build_id: Option<BuildId>,
}

/// Drives one run through build, scan, push, sign and at most one stage deploy.
///
/// Pipeline failures, store failures included, end the run in `Failed` and are
/// returned as part of the record. `Err` is reserved for requests that never
/// touch a run (an unwatched branch, an unknown or finished run) and for a
/// record store that cannot save at all.
pub struct PromotionPipeline {
    caps: Capabilities,
    settings: PipelineSettings,
}

impl PromotionPipeline {
    pub fn new(caps: Capabilities, settings: PipelineSettings) -> Self {
        Self { caps, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn records(&self) -> &dyn RecordStore {
        self.caps.records.as_ref()
    }

    pub async fn run(&self, req: RunRequest, cancel: &CancelHandle) -> Result<RunRecord> {
        let branch = req.branch.strip_prefix("refs/heads/").unwrap_or(&req.branch).to_string();
        if !self.settings.watched_branches.iter().any(|b| *b == branch) {
            bail!("branch {branch} is not watched; nothing to run");
        }
        let ctx = RunContext {
            run_id: RunId::new(),
            project_id: self.settings.project_id.clone(),
            branch,
            build_id: req.build_id.unwrap_or_else(|| BuildId::for_commit(&req.commit_id, now_unix())),
            commit_id: req.commit_id,
            repository: self.settings.repository.clone(),
            source_root: req.source_root,
            started_at_ms: now_ms(),
        };

        let run_dir = self.caps.artifacts.create_run_dir(&ctx.project_id, &ctx.run_id)?;
        info!(run_id = %ctx.run_id, branch = %ctx.branch, commit = %ctx.commit_id, "run triggered");
        let mut record = RunRecord::new(ctx);
        let result = self.build_and_sign(&mut record, &run_dir, cancel).await;
        self.settle(record, &run_dir, result)
    }

    /// Re-enter a run halted at an approval gate.
    pub async fn resume(&self, run_id: &RunId, cancel: &CancelHandle) -> Result<RunRecord> {
        let mut record = self.load_live(run_id)?;
        let Some(stage) = record.halted_at.filter(|_| record.state == RunState::Pending) else {
            bail!("run {run_id} is {} and not halted at an approval gate", record.state);
        };
        let run_dir = self.caps.artifacts.create_run_dir(&record.context.project_id, run_id)?;
        info!(run_id = %run_id, stage = %stage, "run resumed");
        let result = match self.log(&run_dir, &format!("- resumed at {stage}")) {
            Ok(()) => self.promote(&mut record, &run_dir, cancel).await,
            Err(e) => Err(e),
        };
        self.settle(record, &run_dir, result)
    }

    /// Record an approval for `(stage, run)`. Takes effect on the next `resume`.
    pub async fn approve(&self, run_id: &RunId, stage: DeployStage, approved_by: &str) -> Result<ApprovalRecord> {
        let record = self.load_live(run_id)?;
        if !self.settings.stages.iter().any(|d| d.stage == stage) {
            bail!("stage {stage} is not configured");
        }
        let approval = ApprovalRecord::now(stage, run_id.clone(), approved_by);
        self.caps.approvals.record(approval.clone()).await?;
        let run_dir = self.caps.artifacts.create_run_dir(&record.context.project_id, run_id)?;
        self.caps
            .artifacts
            .append_worklog(&run_dir, &format!("- {stage} approved by {approved_by}"))?;
        Ok(approval)
    }

    /// Cancel a run that is not running in this process, typically one halted at an
    /// approval gate. The run ends `Cancelled` and can no longer be resumed.
    pub fn cancel_run(&self, run_id: &RunId) -> Result<RunRecord> {
        let record = self.load_live(run_id)?;
        let run_dir = self.caps.artifacts.create_run_dir(&record.context.project_id, run_id)?;
        self.settle(record, &run_dir, Err(PipelineError::Cancelled))
    }

    fn load_live(&self, run_id: &RunId) -> Result<RunRecord> {
        let record = self
            .caps
            .records
            .load_run(run_id)?
            .ok_or_else(|| anyhow!("run {run_id} not found"))?;
        if record.state.is_terminal() {
            bail!("run {run_id} is already {}", record.state);
        }
        Ok(record)
    }

    async fn build_and_sign(
        &self,
        record: &mut RunRecord,
        run_dir: &Path,
        cancel: &CancelHandle,
    ) -> Result<(), PipelineError> {
        let ctx = record.context.clone();
        self.log(
            run_dir,
            &format!("# Run {}\n\nbranch `{}` commit `{}` build `{}`\n", ctx.run_id, ctx.branch, ctx.commit_id, ctx.build_id),
        )?;
        self.advance(record, run_dir, RunEvent::Triggered)?;

        // Build runs for every watched branch; routing only decides what gets deployed.
        let built = within("build", self.settings.build_timeout, async {
            let artifact = self.caps.builder.build(&ctx).await?;
            let image = self.caps.assembler.assemble(&ctx, &artifact).await?;
            Ok::<_, PipelineError>((artifact, image))
        })
        .await;
        check_cancel(cancel)?;
        let (artifact, image_ref) = built?;
        self.log(run_dir, &format!("- artifact {} ({})", artifact.path.display(), artifact.artifact_digest))?;
        record.artifact = Some(artifact);
        self.advance(record, run_dir, RunEvent::BuildSucceeded)?;

        let targets = [
            ScanTarget::Source {
                path: ctx.source_root.clone(),
            },
            ScanTarget::Image {
                image: image_ref.clone(),
            },
        ];
        let mut results = Vec::with_capacity(targets.len());
        for target in &targets {
            let result = within("scan", self.settings.step_timeout, async {
                Ok::<_, PipelineError>(self.caps.scan_gate.evaluate(target).await)
            })
            .await?;
            results.push(result);
        }
        check_cancel(cancel)?;
        let mut blocked = vec![];
        for result in results {
            let report = report_json(&result).map_err(|e| PipelineError::Storage(format!("encode scan report: {e}")))?;
            self.caps
                .artifacts
                .write_evidence(run_dir, EvidenceKind::ScanReport, &format!("{}.json", result.target.label()), &report)
                .map_err(storage)?;
            let blocking = result.blocking_findings().count();
            self.log(
                run_dir,
                &format!(
                    "- scan {}: {} ({} findings, {} at or above {})",
                    result.target.describe(),
                    if result.passed { "passed" } else { "FAILED" },
                    result.findings.len(),
                    blocking,
                    result.severity_threshold
                ),
            )?;
            if !result.passed {
                let mut reason = format!("{}: {blocking} blocking findings", result.target.describe());
                if !result.errors.is_empty() {
                    reason.push_str(&format!(", scanner errors: {}", result.errors.join("; ")));
                }
                blocked.push(reason);
            }
            record.scans.push(result);
        }
        if !blocked.is_empty() {
            let err = PipelineError::Scan(blocked.join("; "));
            warn!(run_id = %ctx.run_id, error = %err, "scan gate failed");
            record.error = Some(err.to_string());
            return self.advance(record, run_dir, RunEvent::ScanCompleted { passed: false });
        }
        self.advance(record, run_dir, RunEvent::ScanCompleted { passed: true })?;

        let image = within("push", self.settings.step_timeout, async {
            Ok::<_, PipelineError>(
                push_with_retry(self.caps.registry.as_ref(), &image_ref, &self.settings.registry_retry).await?,
            )
        })
        .await?;
        self.log(run_dir, &format!("- pushed {}", image.pinned_reference()))?;
        record.image = Some(image.clone());

        let signed = within("sign", self.settings.step_timeout, async {
            let _guard = self
                .caps
                .locks
                .acquire(&LockRegistry::signing_key(&self.signing_key_id()))
                .await?;
            Ok::<_, PipelineError>(self.caps.signer.sign(&image).await?)
        })
        .await;
        check_cancel(cancel)?;
        let signature = signed?;
        self.log(run_dir, &format!("- signed by key {}", signature.signer_key_id))?;
        record.signature = Some(signature);
        self.advance(record, run_dir, RunEvent::PushedAndSigned)?;

        self.promote(record, run_dir, cancel).await
    }

    async fn promote(&self, record: &mut RunRecord, run_dir: &Path, cancel: &CancelHandle) -> Result<(), PipelineError> {
        check_cancel(cancel)?;

        let selected = self.settings.routing.route(&record.context.branch);
        for def in &self.settings.stages {
            if Some(def.stage) != selected && record.stage_status(def.stage).is_none() {
                let detail = format!("branch {} does not deploy to {}", record.context.branch, def.stage);
                push_outcome(record, def.stage, StageStatus::Skipped, Some(detail));
            }
        }

        let Some(stage) = selected else {
            self.log(run_dir, "- no deploy stage for this branch")?;
            return self.advance(record, run_dir, RunEvent::NoStageSelected);
        };
        let Some(def) = self.settings.stages.iter().find(|d| d.stage == stage) else {
            return Err(PipelineError::Config(format!("no stage definition for {stage}")));
        };

        let prior = match def.depends_on {
            Some(dep) => self.last_deploy_status(dep)?,
            None => None,
        };
        let approved = def.approval_required && self.caps.approvals.is_approved(stage, record.run_id()).await?;

        match evaluate_gate(def, true, prior, approved) {
            GateDecision::Proceed => self.deploy_stage(record, run_dir, def, cancel).await,
            GateDecision::AwaitApproval => {
                if record.stage_status(stage) != Some(StageStatus::AwaitingApproval) {
                    push_outcome(record, stage, StageStatus::AwaitingApproval, None);
                }
                record.halted_at = Some(stage);
                self.log(run_dir, &format_approval_request(&record.context, stage, record.image.as_ref()))?;
                info!(run_id = %record.run_id(), stage = %stage, "halted for approval");
                self.advance(record, run_dir, RunEvent::ApprovalMissing(stage))
            }
            GateDecision::Block { reason } => {
                push_outcome(record, stage, StageStatus::Failed, Some(reason.clone()));
                Err(PipelineError::GateBlocked { stage, reason })
            }
            GateDecision::Skip => Err(PipelineError::GateBlocked {
                stage,
                reason: "stage not selected".into(),
            }),
        }
    }

    /// Outcome of the latest deployment of `stage`'s release, from the deployment log.
    fn last_deploy_status(&self, stage: DeployStage) -> Result<Option<StageStatus>, PipelineError> {
        let Some(def) = self.settings.stages.iter().find(|d| d.stage == stage) else {
            return Ok(None);
        };
        let latest = self
            .caps
            .records
            .latest_deployment(&def.namespace, &def.release_name)
            .map_err(storage)?;
        Ok(latest.map(|d| match d.outcome {
            DeployOutcome::Succeeded => StageStatus::Succeeded,
            DeployOutcome::Failed => StageStatus::Failed,
        }))
    }

    async fn deploy_stage(
        &self,
        record: &mut RunRecord,
        run_dir: &Path,
        def: &StageDef,
        cancel: &CancelHandle,
    ) -> Result<(), PipelineError> {
        record.halted_at = None;
        self.advance(record, run_dir, RunEvent::EnterStage(def.stage))?;

        let (Some(image), Some(signature)) = (record.image.clone(), record.signature.clone()) else {
            return Err(PipelineError::Signature("run has no signed image".into()));
        };
        let Some(key) = self.settings.public_key else {
            return Err(PipelineError::Signature("no public key configured for verification".into()));
        };

        let run_id = record.run_id().clone();
        let deployed = within("deploy", self.settings.step_timeout, async {
            Ok::<_, PipelineError>(self.caps.executor.deploy(&run_id, def, &image, &signature, &key).await?)
        })
        .await;
        check_cancel(cancel)?;

        let deployed = match deployed {
            Ok(deployed) => deployed,
            Err(e) => {
                push_outcome(record, def.stage, StageStatus::Failed, Some(e.to_string()));
                return Err(e);
            }
        };
        let detail = match deployed.record.revision {
            Some(rev) => format!("{}/{} revision {rev}", def.namespace, def.release_name),
            None => format!("{}/{}", def.namespace, def.release_name),
        };
        push_outcome(record, def.stage, StageStatus::Succeeded, Some(detail.clone()));
        self.caps
            .artifacts
            .write_evidence(
                run_dir,
                EvidenceKind::DeployManifest,
                &format!("{}.yaml", def.stage),
                deployed.manifest.as_bytes(),
            )
            .map_err(storage)?;
        self.log(run_dir, &format!("- deployed {} to {detail}", image.pinned_reference()))?;
        self.advance(record, run_dir, RunEvent::DeployFinished { ok: true })
    }

    fn advance(&self, record: &mut RunRecord, run_dir: &Path, event: RunEvent) -> Result<(), PipelineError> {
        let from = record.state;
        record.state = transition(from, &event)?;
        info!(run_id = %record.run_id(), from = %from, to = %record.state, "transition");
        self.log(run_dir, &format!("- {from} -> {}", record.state))?;
        record.updated_at_ms = now_ms();
        self.caps.records.save_run(record).map_err(storage)?;
        self.caps
            .artifacts
            .write_provenance(run_dir, &ProvenanceManifest::from_record(record))
            .map_err(storage)
    }

    /// Turn the outcome of a pass over the run into its persisted end state.
    ///
    /// Any error ends a live run in `Failed` (or `Cancelled`) with the error recorded,
    /// including errors from the stores themselves. `Err` is returned only when the
    /// record could not be saved at all.
    fn settle(&self, mut record: RunRecord, run_dir: &Path, result: Result<(), PipelineError>) -> Result<RunRecord> {
        let Err(err) = result else {
            return Ok(record);
        };
        let from = record.state;
        if from.is_terminal() {
            // Already ended; keep the first error.
            warn!(run_id = %record.run_id(), state = %from, error = %err, "error after run ended");
            record.error.get_or_insert_with(|| err.to_string());
        } else {
            let (event, fallback) = if err.is_cancellation() {
                info!(run_id = %record.run_id(), state = %from, "run cancelled");
                (RunEvent::Cancel, RunState::Cancelled)
            } else {
                warn!(run_id = %record.run_id(), state = %from, error = %err, "run failed");
                (RunEvent::StepFailed, RunState::Failed)
            };
            record.state = transition(from, &event).unwrap_or(fallback);
            record.halted_at = None;
            record.error = Some(err.to_string());
            info!(run_id = %record.run_id(), from = %from, to = %record.state, "transition");
        }
        record.updated_at_ms = now_ms();
        self.caps
            .records
            .save_run(&record)
            .with_context(|| format!("save run {} after error: {err}", record.run_id()))?;

        // The record is durable; provenance is best effort from here on.
        let artifacts = &self.caps.artifacts;
        let written = artifacts
            .append_worklog(run_dir, &format!("- error: {err}\n- {from} -> {}", record.state))
            .and_then(|()| artifacts.write_provenance(run_dir, &ProvenanceManifest::from_record(&record)));
        if let Err(e) = written {
            warn!(run_id = %record.run_id(), "could not write provenance for ended run: {e:#}");
        }
        Ok(record)
    }

    fn log(&self, run_dir: &Path, line: &str) -> Result<(), PipelineError> {
        self.caps.artifacts.append_worklog(run_dir, line).map_err(storage)
    }

    fn signing_key_id(&self) -> String {
        self.settings
            .public_key
            .map(|k| k.key_id())
            .unwrap_or_else(|| "default".to_string())
    }
}

fn check_cancel(cancel: &CancelHandle) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

fn storage(e: anyhow::Error) -> PipelineError {
    PipelineError::Storage(format!("{e:#}"))
}

fn push_outcome(record: &mut RunRecord, stage: DeployStage, status: StageStatus, detail: Option<String>) {
    record.stages.push(StageOutcome {
        stage,
        status,
        detail,
        at_ms: now_ms(),
    });
}
