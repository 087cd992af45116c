use rpl_core::{DeploymentRecord, RunId, RunRecord};

/// Durable run records plus the append-only deployment log.
pub trait RecordStore: Send + Sync {
    /// Insert or replace the record for `record.run_id()`.
    fn save_run(&self, record: &RunRecord) -> anyhow::Result<()>;
    fn load_run(&self, run_id: &RunId) -> anyhow::Result<Option<RunRecord>>;
    /// Most recently started first.
    fn list_runs(&self, limit: usize) -> anyhow::Result<Vec<RunRecord>>;

    /// Deployment records are never updated or deleted.
    fn append_deployment(&self, record: &DeploymentRecord) -> anyhow::Result<()>;
    /// Oldest first.
    fn deployments_for(&self, namespace: &str) -> anyhow::Result<Vec<DeploymentRecord>>;
    fn latest_deployment(&self, namespace: &str, release_name: &str) -> anyhow::Result<Option<DeploymentRecord>>;
}

/// Named, expiring leases shared by every process using the same store.
/// Used to serialize deploys to one namespace and use of one signing key.
pub trait LeaseStore: Send + Sync {
    /// Take `key` for `holder` unless another holder has an unexpired lease on it.
    fn try_acquire_lease(&self, key: &str, holder: &str, ttl_ms: i64) -> anyhow::Result<bool>;
    /// No-op when `holder` no longer owns the lease.
    fn release_lease(&self, key: &str, holder: &str) -> anyhow::Result<()>;
}
