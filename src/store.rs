//! Run persistence with SQLite
//!
//! Stores runs in `.patchgate/runs.db`. The run row is the only thing that
//! advances in place; stage records and audit entries are insert-only and
//! never touched again, so the trail a reviewer reads is exactly what the
//! pipeline wrote at the time.

use crate::audit::AuditEntry;
use crate::run::{Decision, Run, RunStage, StageRecord, StageStatus, TaskType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Persistent store for runs, stage records and the audit log
pub struct RunStore {
    conn: Mutex<Connection>,
}

impl RunStore {
    /// Open or create the run database for a repository
    pub fn open(repo_path: &Path) -> SqlResult<Self> {
        let dir = repo_path.join(".patchgate");
        std::fs::create_dir_all(&dir).ok();

        let db_path = dir.join("runs.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(include_str!("store_schema.sql"))?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("store_schema.sql"))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn create_run(&self, run: &Run) -> SqlResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO runs (
                id, repo_path, commit_sha, branch, task_type, task_description,
                stage, decision, quality_score, risk_score, failure_reason,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run.id.to_string(),
                run.repo_path,
                run.commit_sha,
                run.branch,
                run.task_type.as_str(),
                run.task_description,
                run.stage.as_str(),
                run.decision.map(|d| d.as_str()),
                run.quality_score,
                run.risk_score,
                run.failure_reason,
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Advance the run to a new stage
    pub fn advance_stage(&self, run_id: Uuid, stage: RunStage) -> SqlResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE runs SET stage = ?1, updated_at = ?2 WHERE id = ?3",
            params![stage.as_str(), Utc::now().to_rfc3339(), run_id.to_string()],
        )?;
        Ok(())
    }

    /// Record repository metadata captured at ingest
    pub fn set_repo_head(&self, run_id: Uuid, commit_sha: Option<&str>, branch: Option<&str>) -> SqlResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE runs SET commit_sha = ?1, branch = ?2, updated_at = ?3 WHERE id = ?4",
            params![commit_sha, branch, Utc::now().to_rfc3339(), run_id.to_string()],
        )?;
        Ok(())
    }

    /// Record scores once the scoring stage completes
    pub fn set_scores(&self, run_id: Uuid, quality: f64, risk: f64) -> SqlResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE runs SET quality_score = ?1, risk_score = ?2, updated_at = ?3 WHERE id = ?4",
            params![quality, risk, Utc::now().to_rfc3339(), run_id.to_string()],
        )?;
        Ok(())
    }

    /// Assign the terminal decision. Called exactly once, at finalization.
    pub fn finalize(&self, run_id: Uuid, decision: Decision) -> SqlResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE runs SET stage = ?1, decision = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                RunStage::Finalized.as_str(),
                decision.as_str(),
                Utc::now().to_rfc3339(),
                run_id.to_string()
            ],
        )?;
        Ok(())
    }

    /// Move the run to the terminal failure state with a reason
    pub fn fail(&self, run_id: Uuid, reason: &str) -> SqlResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE runs SET stage = ?1, failure_reason = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                RunStage::Failed.as_str(),
                reason,
                Utc::now().to_rfc3339(),
                run_id.to_string()
            ],
        )?;
        Ok(())
    }

    /// Append one stage record. There is deliberately no update path.
    pub fn append_stage_record(&self, run_id: Uuid, record: &StageRecord) -> SqlResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let seq = next_seq(&conn, "stage_records", run_id)?;
        conn.execute(
            "INSERT INTO stage_records (
                run_id, seq, stage, status, attempt, started_at, ended_at,
                input, output, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run_id.to_string(),
                seq,
                record.stage.as_str(),
                record.status.as_str(),
                record.attempt,
                record.started_at.to_rfc3339(),
                record.ended_at.to_rfc3339(),
                record.input.as_ref().map(|v| v.to_string()),
                record.output.as_ref().map(|v| v.to_string()),
                record.error,
            ],
        )?;
        Ok(())
    }

    /// Append one audit entry. Insert-only, like stage records.
    pub fn append_audit(&self, run_id: Uuid, entry: &AuditEntry) -> SqlResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let seq = next_seq(&conn, "audit_log", run_id)?;
        conn.execute(
            "INSERT INTO audit_log (run_id, seq, created_at, actor, stage, message, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id.to_string(),
                seq,
                entry.created_at.to_rfc3339(),
                entry.actor.as_str(),
                entry.stage.as_str(),
                entry.message,
                entry.payload.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Load a run with its ordered stage records
    pub fn get_run(&self, run_id: Uuid) -> SqlResult<Option<Run>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, repo_path, commit_sha, branch, task_type, task_description,
                    stage, decision, quality_score, risk_score, failure_reason,
                    created_at, updated_at
             FROM runs WHERE id = ?1",
        )?;

        let mut rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok(Run {
                id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
                repo_path: row.get(1)?,
                commit_sha: row.get(2)?,
                branch: row.get(3)?,
                task_type: TaskType::from_str(&row.get::<_, String>(4)?)
                    .unwrap_or(TaskType::Review),
                task_description: row.get(5)?,
                stage: RunStage::from_str(&row.get::<_, String>(6)?)
                    .unwrap_or(RunStage::Failed),
                decision: row
                    .get::<_, Option<String>>(7)?
                    .and_then(|s| Decision::from_str(&s)),
                quality_score: row.get(8)?,
                risk_score: row.get(9)?,
                failure_reason: row.get(10)?,
                created_at: parse_timestamp(&row.get::<_, String>(11)?),
                updated_at: parse_timestamp(&row.get::<_, String>(12)?),
                stage_records: Vec::new(),
            })
        })?;

        let mut run = match rows.next() {
            Some(r) => r?,
            None => return Ok(None),
        };

        let mut stmt = conn.prepare(
            "SELECT stage, status, attempt, started_at, ended_at, input, output, error
             FROM stage_records WHERE run_id = ?1 ORDER BY seq",
        )?;
        let records = stmt.query_map(params![run_id.to_string()], |row| {
            Ok(StageRecord {
                stage: RunStage::from_str(&row.get::<_, String>(0)?)
                    .unwrap_or(RunStage::Failed),
                status: StageStatus::from_str(&row.get::<_, String>(1)?)
                    .unwrap_or(StageStatus::Failed),
                attempt: row.get(2)?,
                started_at: parse_timestamp(&row.get::<_, String>(3)?),
                ended_at: parse_timestamp(&row.get::<_, String>(4)?),
                input: parse_json_column(row.get::<_, Option<String>>(5)?),
                output: parse_json_column(row.get::<_, Option<String>>(6)?),
                error: row.get(7)?,
            })
        })?;
        run.stage_records = records.collect::<SqlResult<Vec<_>>>()?;

        Ok(Some(run))
    }

    /// The full audit trail for a run, in write order
    pub fn audit_trail(&self, run_id: Uuid) -> SqlResult<Vec<AuditEntry>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT created_at, actor, stage, message, payload
             FROM audit_log WHERE run_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok(AuditEntry {
                created_at: parse_timestamp(&row.get::<_, String>(0)?),
                actor: crate::audit::Actor::from_str(&row.get::<_, String>(1)?),
                stage: RunStage::from_str(&row.get::<_, String>(2)?)
                    .unwrap_or(RunStage::Failed),
                message: row.get(3)?,
                payload: parse_json_column(row.get::<_, Option<String>>(4)?),
            })
        })?;
        rows.collect()
    }
}

fn next_seq(conn: &Connection, table: &str, run_id: Uuid) -> SqlResult<i64> {
    // table is a compile-time constant in all call sites
    let sql = format!(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM {} WHERE run_id = ?1",
        table
    );
    conn.query_row(&sql, params![run_id.to_string()], |row| row.get(0))
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_json_column(col: Option<String>) -> Option<serde_json::Value> {
    col.and_then(|s| serde_json::from_str(&s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{Actor, AuditEntry};
    use serde_json::json;

    fn sample_record(stage: RunStage, status: StageStatus) -> StageRecord {
        StageRecord {
            stage,
            status,
            attempt: 1,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            input: Some(json!({"k": 20})),
            output: Some(json!({"chunks": 3})),
            error: None,
        }
    }

    #[test]
    fn test_create_and_load_run() {
        let store = RunStore::open_in_memory().unwrap();
        let run = Run::new("/tmp/repo", TaskType::Bugfix, "fix the flaky test");
        store.create_run(&run).unwrap();

        let loaded = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.task_type, TaskType::Bugfix);
        assert_eq!(loaded.stage, RunStage::Ingested);
        assert!(loaded.decision.is_none());
    }

    #[test]
    fn test_stage_records_keep_insertion_order() {
        let store = RunStore::open_in_memory().unwrap();
        let run = Run::new("/tmp/repo", TaskType::Refactor, "tidy");
        store.create_run(&run).unwrap();

        store
            .append_stage_record(run.id, &sample_record(RunStage::Ingested, StageStatus::Succeeded))
            .unwrap();
        store
            .append_stage_record(
                run.id,
                &sample_record(RunStage::ContextRetrieved, StageStatus::Succeeded),
            )
            .unwrap();
        // A retried stage appends a second record rather than editing the first
        let mut retry = sample_record(RunStage::PatchGenerated, StageStatus::Failed);
        retry.error = Some("rate limited".to_string());
        store.append_stage_record(run.id, &retry).unwrap();
        let mut retry2 = sample_record(RunStage::PatchGenerated, StageStatus::Succeeded);
        retry2.attempt = 2;
        store.append_stage_record(run.id, &retry2).unwrap();

        let loaded = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.stage_records.len(), 4);
        assert_eq!(loaded.stage_records[2].status, StageStatus::Failed);
        assert_eq!(loaded.stage_records[2].error.as_deref(), Some("rate limited"));
        assert_eq!(loaded.stage_records[3].attempt, 2);
    }

    #[test]
    fn test_finalize_assigns_decision() {
        let store = RunStore::open_in_memory().unwrap();
        let run = Run::new("/tmp/repo", TaskType::Review, "look things over");
        store.create_run(&run).unwrap();

        store.set_scores(run.id, 92.5, 0.05).unwrap();
        store.finalize(run.id, Decision::AutoApprove).unwrap();

        let loaded = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.stage, RunStage::Finalized);
        assert_eq!(loaded.decision, Some(Decision::AutoApprove));
        assert_eq!(loaded.quality_score, Some(92.5));
    }

    #[test]
    fn test_failed_run_keeps_reason_and_no_decision() {
        let store = RunStore::open_in_memory().unwrap();
        let run = Run::new("/tmp/repo", TaskType::Bugfix, "fix");
        store.create_run(&run).unwrap();

        store.fail(run.id, "cancelled").unwrap();

        let loaded = store.get_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.stage, RunStage::Failed);
        assert_eq!(loaded.failure_reason.as_deref(), Some("cancelled"));
        assert!(loaded.decision.is_none());
    }

    #[test]
    fn test_audit_trail_preserves_write_order() {
        let store = RunStore::open_in_memory().unwrap();
        let run = Run::new("/tmp/repo", TaskType::Bugfix, "fix");
        store.create_run(&run).unwrap();

        for (i, msg) in ["run started", "repo ingested", "context retrieved"].iter().enumerate() {
            let entry = AuditEntry {
                created_at: Utc::now(),
                actor: Actor::System,
                stage: RunStage::Ingested,
                message: msg.to_string(),
                payload: Some(json!({"i": i})),
            };
            store.append_audit(run.id, &entry).unwrap();
        }

        let trail = store.audit_trail(run.id).unwrap();
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].message, "run started");
        assert_eq!(trail[2].message, "context retrieved");
    }

    #[test]
    fn test_missing_run_is_none() {
        let store = RunStore::open_in_memory().unwrap();
        assert!(store.get_run(Uuid::new_v4()).unwrap().is_none());
    }
}
