//! Audit trail
//!
//! Every consequential pipeline event leaves a write-once entry a human
//! reviewer can replay later. Entries are facts about what happened, with
//! the payload a reviewer needs to check the pipeline's work.

use crate::run::{Decision, RunStage};
use crate::store::RunStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

/// Who produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    System,
    Agent,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::System => "system",
            Actor::Agent => "agent",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "agent" => Actor::Agent,
            _ => Actor::System,
        }
    }
}

/// One immutable audit fact
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub created_at: DateTime<Utc>,
    pub actor: Actor,
    pub stage: RunStage,
    pub message: String,
    pub payload: Option<serde_json::Value>,
}

/// Typed writer for a single run's audit trail
pub struct AuditLogger<'a> {
    store: &'a RunStore,
    run_id: Uuid,
}

impl<'a> AuditLogger<'a> {
    pub fn new(store: &'a RunStore, run_id: Uuid) -> Self {
        Self { store, run_id }
    }

    fn log(
        &self,
        actor: Actor,
        stage: RunStage,
        message: &str,
        payload: serde_json::Value,
    ) -> Result<(), rusqlite::Error> {
        let entry = AuditEntry {
            created_at: Utc::now(),
            actor,
            stage,
            message: message.to_string(),
            payload: Some(payload),
        };
        self.store.append_audit(self.run_id, &entry)
    }

    pub fn run_started(&self, task_type: &str, description: &str) -> Result<(), rusqlite::Error> {
        self.log(
            Actor::System,
            RunStage::Ingested,
            "run started",
            json!({
                "task_type": task_type,
                "task_description": crate::util::truncate(description, 500),
            }),
        )
    }

    pub fn repo_ingested(
        &self,
        file_count: usize,
        commit_sha: Option<&str>,
        branch: Option<&str>,
    ) -> Result<(), rusqlite::Error> {
        self.log(
            Actor::System,
            RunStage::Ingested,
            "repository ingested",
            json!({
                "file_count": file_count,
                "commit_sha": commit_sha,
                "branch": branch,
            }),
        )
    }

    pub fn context_retrieved(
        &self,
        chunk_count: usize,
        avg_score: f64,
    ) -> Result<(), rusqlite::Error> {
        self.log(
            Actor::System,
            RunStage::ContextRetrieved,
            "context retrieved",
            json!({ "chunk_count": chunk_count, "avg_score": avg_score }),
        )
    }

    pub fn plan_generated(
        &self,
        description: &str,
        files: &[String],
        confidence: f64,
    ) -> Result<(), rusqlite::Error> {
        self.log(
            Actor::Agent,
            RunStage::PatchPlanned,
            "change plan generated",
            json!({
                "summary": crate::util::truncate(description, 500),
                "files_to_modify": files,
                "confidence": confidence,
            }),
        )
    }

    pub fn patch_generated(
        &self,
        files: &[String],
        lines_added: usize,
        lines_removed: usize,
    ) -> Result<(), rusqlite::Error> {
        self.log(
            Actor::Agent,
            RunStage::PatchGenerated,
            "patch generated",
            json!({
                "files": files,
                "lines_added": lines_added,
                "lines_removed": lines_removed,
            }),
        )
    }

    pub fn patch_applied(&self, sandbox_path: &str) -> Result<(), rusqlite::Error> {
        self.log(
            Actor::System,
            RunStage::PatchApplied,
            "patch applied in sandbox",
            json!({ "sandbox": sandbox_path }),
        )
    }

    pub fn check_executed(
        &self,
        check: &str,
        passed: bool,
        finding_count: usize,
        timed_out: bool,
    ) -> Result<(), rusqlite::Error> {
        self.log(
            Actor::System,
            RunStage::ChecksRun,
            "check executed",
            json!({
                "check": check,
                "passed": passed,
                "findings": finding_count,
                "timed_out": timed_out,
            }),
        )
    }

    pub fn decision_made(
        &self,
        decision: Decision,
        quality: f64,
        risk: f64,
        gate_failures: &[String],
        risk_flags: &[String],
    ) -> Result<(), rusqlite::Error> {
        self.log(
            Actor::System,
            RunStage::Scored,
            "decision computed",
            json!({
                "decision": decision.as_str(),
                "quality_score": quality,
                "risk_score": risk,
                "gate_failures": gate_failures,
                "risk_flags": risk_flags,
            }),
        )
    }

    pub fn run_finalized(&self, decision: Option<Decision>, reason: Option<&str>) -> Result<(), rusqlite::Error> {
        let stage = if decision.is_some() { RunStage::Finalized } else { RunStage::Failed };
        self.log(
            Actor::System,
            stage,
            "run finalized",
            json!({
                "decision": decision.map(|d| d.as_str()),
                "failure_reason": reason,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Run, TaskType};

    #[test]
    fn test_typed_events_land_in_order() {
        let store = RunStore::open_in_memory().unwrap();
        let run = Run::new("/tmp/repo", TaskType::Bugfix, "fix the bug");
        store.create_run(&run).unwrap();

        let audit = AuditLogger::new(&store, run.id);
        audit.run_started("bugfix", "fix the bug").unwrap();
        audit.repo_ingested(12, Some("abc123"), Some("main")).unwrap();
        audit.check_executed("tests", false, 2, false).unwrap();
        audit
            .decision_made(Decision::Reject, 55.0, 0.4, &["Tests failed".into()], &[])
            .unwrap();

        let trail = store.audit_trail(run.id).unwrap();
        assert_eq!(trail.len(), 4);
        assert_eq!(trail[0].message, "run started");
        assert_eq!(trail[0].actor, Actor::System);
        let payload = trail[3].payload.as_ref().unwrap();
        assert_eq!(payload["decision"], "reject");
        assert_eq!(payload["gate_failures"][0], "Tests failed");
    }

    #[test]
    fn test_actor_round_trip() {
        assert_eq!(Actor::from_str(Actor::Agent.as_str()), Actor::Agent);
        assert_eq!(Actor::from_str("unknown"), Actor::System);
    }
}
