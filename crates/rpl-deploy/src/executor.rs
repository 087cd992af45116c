use std::collections::BTreeMap;
use std::sync::Arc;

use rpl_core::{now_ms, DeployOutcome, DeploymentId, DeploymentRecord, Image, RunId, Signature, StageDef};
use rpl_sign::{ensure_verified, PublicKey};
use rpl_step::LockRegistry;
use rpl_storage::RecordStore;
use tracing::{info, warn};

use crate::{render, template_values, ApplyRequest, ClusterApplier, DeployError};

/// Result of a successful stage deploy.
#[derive(Clone, Debug)]
pub struct Deployed {
    pub record: DeploymentRecord,
    pub manifest: String,
    pub changed: bool,
}

pub struct DeploymentExecutor {
    applier: Arc<dyn ClusterApplier>,
    records: Arc<dyn RecordStore>,
    locks: Arc<LockRegistry>,
    template: String,
    resources: BTreeMap<String, String>,
}

impl DeploymentExecutor {
    pub fn new(
        applier: Arc<dyn ClusterApplier>,
        records: Arc<dyn RecordStore>,
        locks: Arc<LockRegistry>,
        template: impl Into<String>,
        resources: BTreeMap<String, String>,
    ) -> Self {
        Self {
            applier,
            records,
            locks,
            template: template.into(),
            resources,
        }
    }

    /// Verify the signature, render, apply and record, all under the namespace lock.
    /// A signature that does not verify blocks the deploy before anything is applied.
    /// Every render or apply attempt appends a DeploymentRecord, successful or not.
    pub async fn deploy(
        &self,
        run_id: &RunId,
        def: &StageDef,
        image: &Image,
        signature: &Signature,
        key: &PublicKey,
    ) -> Result<Deployed, DeployError> {
        let _guard = self.locks.acquire(&LockRegistry::namespace_key(&def.namespace)).await?;

        ensure_verified(&image.digest, signature, key)?;

        let values = template_values(&def.namespace, &def.release_name, image, &self.resources);
        let manifest = match render(&self.template, &values) {
            Ok(m) => m,
            Err(e) => {
                self.record(run_id, def, image, Err(&e))?;
                return Err(e);
            }
        };

        let request = ApplyRequest {
            namespace: def.namespace.clone(),
            release_name: def.release_name.clone(),
            image: image.clone(),
            manifest,
        };
        match self.applier.apply(&request).await {
            Ok(receipt) => {
                let record = self.record(run_id, def, image, Ok(receipt.revision))?;
                info!(
                    run_id = %run_id,
                    stage = %def.stage,
                    namespace = %def.namespace,
                    digest = %image.digest,
                    changed = receipt.changed,
                    "deployed"
                );
                Ok(Deployed {
                    record,
                    manifest: request.manifest,
                    changed: receipt.changed,
                })
            }
            Err(e) => {
                warn!(run_id = %run_id, stage = %def.stage, error = %e, "deploy failed");
                self.record(run_id, def, image, Err(&e))?;
                Err(e)
            }
        }
    }

    fn record(
        &self,
        run_id: &RunId,
        def: &StageDef,
        image: &Image,
        result: Result<Option<u64>, &DeployError>,
    ) -> Result<DeploymentRecord, DeployError> {
        let (outcome, revision, error) = match result {
            Ok(revision) => (DeployOutcome::Succeeded, revision, None),
            Err(e) => (DeployOutcome::Failed, None, Some(e.to_string())),
        };
        let record = DeploymentRecord {
            id: DeploymentId::new(),
            run_id: run_id.clone(),
            stage: def.stage,
            image: image.clone(),
            namespace: def.namespace.clone(),
            release_name: def.release_name.clone(),
            outcome,
            revision,
            error,
            recorded_at_ms: now_ms(),
        };
        self.records
            .append_deployment(&record)
            .map_err(|e| DeployError::Record(format!("{e:#}")))?;
        Ok(record)
    }
}
