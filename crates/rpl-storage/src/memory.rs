use std::collections::HashMap;
use std::sync::Mutex;

use rpl_core::{now_ms, DeploymentRecord, EpochMs, RunId, RunRecord};

use crate::traits::{LeaseStore, RecordStore};

/// In-memory store for tests. Not durable.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<String, RunRecord>,
    deployments: Vec<DeploymentRecord>,
    /// key -> (holder, expires_at_ms)
    leases: HashMap<String, (String, EpochMs)>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for InMemoryStore {
    fn save_run(&self, record: &RunRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.runs.insert(record.run_id().0.clone(), record.clone());
        Ok(())
    }

    fn load_run(&self, run_id: &RunId) -> anyhow::Result<Option<RunRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.runs.get(run_id.as_str()).cloned())
    }

    fn list_runs(&self, limit: usize) -> anyhow::Result<Vec<RunRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut runs: Vec<_> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| {
            b.context
                .started_at_ms
                .cmp(&a.context.started_at_ms)
                .then_with(|| b.context.run_id.cmp(&a.context.run_id))
        });
        runs.truncate(limit);
        Ok(runs)
    }

    fn append_deployment(&self, record: &DeploymentRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.deployments.iter().any(|d| d.id == record.id) {
            anyhow::bail!("deployment {} already recorded", record.id);
        }
        inner.deployments.push(record.clone());
        Ok(())
    }

    fn deployments_for(&self, namespace: &str) -> anyhow::Result<Vec<DeploymentRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.deployments.iter().filter(|d| d.namespace == namespace).cloned().collect())
    }

    fn latest_deployment(&self, namespace: &str, release_name: &str) -> anyhow::Result<Option<DeploymentRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .deployments
            .iter()
            .rev()
            .find(|d| d.namespace == namespace && d.release_name == release_name)
            .cloned())
    }
}

impl LeaseStore for InMemoryStore {
    fn try_acquire_lease(&self, key: &str, holder: &str, ttl_ms: i64) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_ms();
        if let Some((_, expires_at)) = inner.leases.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        inner.leases.insert(key.to_string(), (holder.to_string(), now + ttl_ms));
        Ok(true)
    }

    fn release_lease(&self, key: &str, holder: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.leases.get(key).is_some_and(|(h, _)| h == holder) {
            inner.leases.remove(key);
        }
        Ok(())
    }
}
