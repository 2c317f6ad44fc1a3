//! Run, stage and decision data model
//!
//! A Run is one end-to-end attempt to fulfill a task against a repository.
//! It moves strictly forward through a fixed stage sequence; every stage
//! attempt leaves an immutable StageRecord behind as the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of change the run is asked to make
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Refactor,
    Bugfix,
    Review,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Refactor => "refactor",
            TaskType::Bugfix => "bugfix",
            TaskType::Review => "review",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "refactor" => Some(TaskType::Refactor),
            "bugfix" => Some(TaskType::Bugfix),
            "review" => Some(TaskType::Review),
            _ => None,
        }
    }
}

/// Terminal classification of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoApprove,
    NeedsReview,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::AutoApprove => "auto_approve",
            Decision::NeedsReview => "needs_review",
            Decision::Reject => "reject",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "auto_approve" => Some(Decision::AutoApprove),
            "needs_review" => Some(Decision::NeedsReview),
            "reject" => Some(Decision::Reject),
            _ => None,
        }
    }
}

/// Fixed pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Ingested,
    ContextRetrieved,
    PatchPlanned,
    PatchGenerated,
    PatchApplied,
    ChecksRun,
    Scored,
    Explained,
    Finalized,
    Failed,
}

/// The full forward sequence, excluding the terminal failure state.
pub const STAGE_ORDER: [RunStage; 9] = [
    RunStage::Ingested,
    RunStage::ContextRetrieved,
    RunStage::PatchPlanned,
    RunStage::PatchGenerated,
    RunStage::PatchApplied,
    RunStage::ChecksRun,
    RunStage::Scored,
    RunStage::Explained,
    RunStage::Finalized,
];

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Ingested => "ingested",
            RunStage::ContextRetrieved => "context_retrieved",
            RunStage::PatchPlanned => "patch_planned",
            RunStage::PatchGenerated => "patch_generated",
            RunStage::PatchApplied => "patch_applied",
            RunStage::ChecksRun => "checks_run",
            RunStage::Scored => "scored",
            RunStage::Explained => "explained",
            RunStage::Finalized => "finalized",
            RunStage::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        STAGE_ORDER
            .iter()
            .copied()
            .chain(std::iter::once(RunStage::Failed))
            .find(|stage| stage.as_str() == s)
    }

    /// The stage that follows this one, or None at the end of the line.
    /// Failed has no successor.
    pub fn next(&self) -> Option<RunStage> {
        let idx = STAGE_ORDER.iter().position(|s| s == self)?;
        STAGE_ORDER.get(idx + 1).copied()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Finalized | RunStage::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(StageStatus::Succeeded),
            "failed" => Some(StageStatus::Failed),
            "skipped" => Some(StageStatus::Skipped),
            _ => None,
        }
    }
}

/// One executed stage attempt. Write-once: corrections are new records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: RunStage,
    pub status: StageStatus,
    /// 1-based attempt number; retried stages leave one record per attempt
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// What the stage consumed, as recorded JSON
    pub input: Option<serde_json::Value>,
    /// What the stage produced, as recorded JSON
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// One end-to-end review/patch attempt against a repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub repo_path: String,
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub task_type: TaskType,
    pub task_description: String,
    pub stage: RunStage,
    pub decision: Option<Decision>,
    pub quality_score: Option<f64>,
    pub risk_score: Option<f64>,
    /// Populated only when stage == Failed
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stage_records: Vec<StageRecord>,
}

impl Run {
    pub fn new(repo_path: &str, task_type: TaskType, task_description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repo_path: repo_path.to_string(),
            commit_sha: None,
            branch: None,
            task_type,
            task_description: task_description.to_string(),
            stage: RunStage::Ingested,
            decision: None,
            quality_score: None,
            risk_score: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            stage_records: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_advances_to_finalized() {
        let mut stage = RunStage::Ingested;
        let mut hops = 0;
        while let Some(next) = stage.next() {
            stage = next;
            hops += 1;
        }
        assert_eq!(stage, RunStage::Finalized);
        assert_eq!(hops, STAGE_ORDER.len() - 1);
    }

    #[test]
    fn test_failed_has_no_successor() {
        assert_eq!(RunStage::Failed.next(), None);
        assert!(RunStage::Failed.is_terminal());
        assert!(RunStage::Finalized.is_terminal());
        assert!(!RunStage::ChecksRun.is_terminal());
    }

    #[test]
    fn test_stage_str_round_trip() {
        for stage in STAGE_ORDER {
            assert_eq!(RunStage::from_str(stage.as_str()), Some(stage));
        }
        assert_eq!(RunStage::from_str("failed"), Some(RunStage::Failed));
        assert_eq!(RunStage::from_str("warp_drive"), None);
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = Run::new("/tmp/repo", TaskType::Bugfix, "fix the thing");
        assert_eq!(run.stage, RunStage::Ingested);
        assert!(run.decision.is_none());
        assert!(run.quality_score.is_none());
        assert!(!run.is_terminal());
    }
}
