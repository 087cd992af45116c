use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use rpl_core::{now_ms, DeployOutcome, DeploymentRecord, RunId, RunRecord};
use rpl_storage::{LeaseStore, RecordStore};
use rusqlite::{params, Connection, OptionalExtension};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db {}", db_path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // journal_mode answers with the resulting mode ("memory" for in-memory dbs).
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        for sql in [
            include_str!("../migrations/0001_init.sql"),
            include_str!("../migrations/0002_leases.sql"),
        ] {
            conn.execute_batch(sql).context("apply migrations")?;
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn outcome_to_str(o: DeployOutcome) -> &'static str {
        match o {
            DeployOutcome::Succeeded => "succeeded",
            DeployOutcome::Failed => "failed",
        }
    }

    fn decode_deployments(rows: Vec<String>) -> Result<Vec<DeploymentRecord>> {
        rows.iter()
            .map(|json| serde_json::from_str(json).context("decode deployment record"))
            .collect()
    }
}

impl RecordStore for SqliteStore {
    fn save_run(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let ctx = &record.context;
        self.conn().execute(
            "INSERT INTO runs(id, project_id, branch, commit_id, state, started_at_ms, updated_at_ms, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET state = excluded.state,
                                           updated_at_ms = excluded.updated_at_ms,
                                           record_json = excluded.record_json",
            params![
                ctx.run_id.as_str(),
                ctx.project_id,
                ctx.branch,
                ctx.commit_id,
                record.state.label(),
                ctx.started_at_ms,
                record.updated_at_ms,
                json
            ],
        )?;
        Ok(())
    }

    fn load_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let json: Option<String> = self
            .conn()
            .query_row("SELECT record_json FROM runs WHERE id = ?1", [run_id.as_str()], |r| r.get(0))
            .optional()?;
        json.map(|j| serde_json::from_str(&j).with_context(|| format!("decode run {run_id}")))
            .transpose()
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT record_json FROM runs ORDER BY started_at_ms DESC, id DESC LIMIT ?1")?;
        let rows = stmt.query_map([limit as i64], |r| r.get::<_, String>(0))?;
        let mut out = vec![];
        for row in rows {
            out.push(serde_json::from_str(&row?).context("decode run record")?);
        }
        Ok(out)
    }

    fn append_deployment(&self, record: &DeploymentRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.conn()
            .execute(
                "INSERT INTO deployments(id, run_id, stage, namespace, release_name, image_digest, outcome, recorded_at_ms, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id.as_str(),
                    record.run_id.as_str(),
                    record.stage.as_str(),
                    record.namespace,
                    record.release_name,
                    record.image.digest,
                    Self::outcome_to_str(record.outcome),
                    record.recorded_at_ms,
                    json
                ],
            )
            .with_context(|| format!("append deployment {}", record.id))?;
        Ok(())
    }

    fn deployments_for(&self, namespace: &str) -> Result<Vec<DeploymentRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT record_json FROM deployments WHERE namespace = ?1 ORDER BY seq")?;
        let rows = stmt
            .query_map([namespace], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Self::decode_deployments(rows)
    }

    fn latest_deployment(&self, namespace: &str, release_name: &str) -> Result<Option<DeploymentRecord>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT record_json FROM deployments WHERE namespace = ?1 AND release_name = ?2
                 ORDER BY seq DESC LIMIT 1",
                params![namespace, release_name],
                |r| r.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).context("decode deployment record"))
            .transpose()
    }
}

impl LeaseStore for SqliteStore {
    fn try_acquire_lease(&self, key: &str, holder: &str, ttl_ms: i64) -> Result<bool> {
        let now = now_ms();
        // A single upsert, so two processes racing on one key cannot both win.
        let changed = self
            .conn()
            .execute(
                "INSERT INTO leases(key, holder, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET holder = excluded.holder,
                                                expires_at_ms = excluded.expires_at_ms
                 WHERE leases.expires_at_ms <= ?4",
                params![key, holder, now + ttl_ms, now],
            )
            .with_context(|| format!("acquire lease {key}"))?;
        Ok(changed == 1)
    }

    fn release_lease(&self, key: &str, holder: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM leases WHERE key = ?1 AND holder = ?2", params![key, holder])
            .with_context(|| format!("release lease {key}"))?;
        Ok(())
    }
}
