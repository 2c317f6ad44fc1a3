//! Run orchestrator
//!
//! Drives a run through the fixed stage sequence: ingest, retrieve
//! context, plan, generate, apply in sandbox, run checks, score, explain,
//! finalize. Every stage attempt is recorded immutably; generation and
//! sandbox execution retry transient failures with exponential backoff;
//! everything else fails the run. Each stage consumes only the previous
//! stage's outputs plus the original task, so a recorded run can be
//! replayed stage by stage.

use crate::audit::AuditLogger;
use crate::config::Config;
use crate::diff::{Patch, PatchScreen};
use crate::error::PipelineError;
use crate::generate::{
    format_check_summary, ChangePlan, ExplainRequest, GenerationError, PatchGenerator,
};
use crate::retrieve::ContextRetriever;
use crate::run::{Run, RunStage, StageRecord, StageStatus, TaskType};
use crate::sandbox::Sandbox;
use crate::score::ScoringEngine;
use crate::store::RunStore;
use crate::util::run_command_with_timeout;
use crate::validate::{detect_project_type, validators_for};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const GIT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The pipeline: ports in, decisions out
pub struct Pipeline {
    store: Arc<RunStore>,
    retriever: Arc<dyn ContextRetriever>,
    generator: Arc<dyn PatchGenerator>,
    config: Config,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    /// Build a pipeline, validating configuration up front: a bad config
    /// is a startup failure, never a per-run one.
    pub fn new(
        store: Arc<RunStore>,
        retriever: Arc<dyn ContextRetriever>,
        generator: Arc<dyn PatchGenerator>,
        config: Config,
    ) -> Result<Self, PipelineError> {
        let w = &config.weights;
        let sum = w.tests + w.typecheck + w.security + w.lint + w.format;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(PipelineError::Configuration(format!(
                "scoring weights must sum to 1.0, got {}",
                sum
            )));
        }
        if config.thresholds.risk_review > config.thresholds.risk_reject {
            return Err(PipelineError::Configuration(
                "risk_review threshold exceeds risk_reject".to_string(),
            ));
        }
        if config.thresholds.quality_review > config.thresholds.quality_approve {
            return Err(PipelineError::Configuration(
                "quality_review threshold exceeds quality_approve".to_string(),
            ));
        }
        if config.retry.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            store,
            retriever,
            generator,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The external cancellation handle. Setting it moves any non-terminal
    /// run to Failed and kills in-flight sandbox processes.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Create a run record. Execution happens separately via `execute`.
    pub fn submit(
        &self,
        repo_path: &Path,
        task_type: TaskType,
        task_description: &str,
    ) -> Result<Uuid, PipelineError> {
        let run = Run::new(&repo_path.to_string_lossy(), task_type, task_description);
        self.store.create_run(&run)?;
        AuditLogger::new(&self.store, run.id)
            .run_started(task_type.as_str(), task_description)?;
        info!(run_id = %run.id, task_type = task_type.as_str(), "run submitted");
        Ok(run.id)
    }

    /// Execute the full stage sequence. Stage failures are recorded and
    /// produce a Failed run; only store-level trouble surfaces as Err.
    pub async fn execute(&self, run_id: Uuid) -> Result<Run, PipelineError> {
        if let Err(err) = self.drive(run_id).await {
            let reason = err.to_string();
            warn!(run_id = %run_id, %reason, "run failed");
            self.store.fail(run_id, &reason)?;
            AuditLogger::new(&self.store, run_id).run_finalized(None, Some(&reason))?;
        }

        self.store.get_run(run_id)?.ok_or_else(|| PipelineError::Stage {
            stage: "finalize",
            detail: format!("run {} missing from store", run_id),
        })
    }

    async fn drive(&self, run_id: Uuid) -> Result<(), PipelineError> {
        let run = self.store.get_run(run_id)?.ok_or_else(|| PipelineError::Stage {
            stage: "ingest",
            detail: format!("run {} was never submitted", run_id),
        })?;
        let repo = PathBuf::from(&run.repo_path);
        let audit = AuditLogger::new(&self.store, run_id);

        // ---- Ingest ----------------------------------------------------
        self.check_cancel()?;
        {
            let started = Utc::now();
            let input = json!({ "repo_path": &run.repo_path });
            match self.ingest(run_id, &repo) {
                Ok(output) => {
                    self.record(run_id, RunStage::Ingested, 1, started, input, Ok(&output))?;
                    audit.repo_ingested(
                        output["file_count"].as_u64().unwrap_or(0) as usize,
                        output["commit_sha"].as_str(),
                        output["branch"].as_str(),
                    )?;
                }
                Err(err) => {
                    self.record(run_id, RunStage::Ingested, 1, started, input, Err(&err))?;
                    return Err(err);
                }
            }
        }

        // ---- Retrieve context (never retried) --------------------------
        self.check_cancel()?;
        let chunks = {
            let started = Utc::now();
            let k = self.config.limits.retrieval_top_k;
            let input = json!({ "query": &run.task_description, "k": k });
            match self.retriever.retrieve(&run.task_description, &repo, k).await {
                Ok(chunks) => {
                    let output = json!({ "chunks": &chunks });
                    self.record(run_id, RunStage::ContextRetrieved, 1, started, input, Ok(&output))?;
                    let avg = if chunks.is_empty() {
                        0.0
                    } else {
                        chunks.iter().map(|c| c.score).sum::<f64>() / chunks.len() as f64
                    };
                    audit.context_retrieved(chunks.len(), avg)?;
                    chunks
                }
                Err(detail) => {
                    let err = PipelineError::Stage { stage: "context_retrieved", detail };
                    self.record(run_id, RunStage::ContextRetrieved, 1, started, input, Err(&err))?;
                    return Err(err);
                }
            }
        };

        // ---- Plan (generation: retryable) ------------------------------
        let plan = {
            let input = json!({
                "task": &run.task_description,
                "chunk_ids": chunks.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            });
            let mut plan = None;
            let max = self.config.retry.max_attempts;
            for attempt in 1..=max {
                self.check_cancel()?;
                let started = Utc::now();
                let result = self
                    .generator
                    .plan_change(run.task_type, &run.task_description, &chunks)
                    .await
                    .map_err(map_generation_error)
                    .and_then(|p| self.validate_plan(p, &repo));
                match result {
                    Ok(p) => {
                        let output = json!({ "plan": &p });
                        self.record(run_id, RunStage::PatchPlanned, attempt, started, input.clone(), Ok(&output))?;
                        plan = Some(p);
                        break;
                    }
                    Err(err) => {
                        self.record(run_id, RunStage::PatchPlanned, attempt, started, input.clone(), Err(&err))?;
                        self.backoff_or_bail(err, attempt, max, "planning").await?;
                    }
                }
            }
            let Some(plan) = plan else {
                return Err(PipelineError::TransientInfra("planning attempts exhausted".into()));
            };
            audit.plan_generated(&plan.description, &plan.files_to_modify, plan.confidence)?;
            plan
        };

        // ---- Generate patch (generation: retryable) --------------------
        let patch = {
            let input = json!({
                "files": &plan.files_to_modify,
                "rationale": &plan.rationale,
            });
            let mut patch = None;
            let max = self.config.retry.max_attempts;
            for attempt in 1..=max {
                self.check_cancel()?;
                let started = Utc::now();
                match self.generate_patch(&repo, &plan, &chunks).await {
                    Ok(p) => {
                        let output = json!({
                            "patch": &p,
                            "diff_hash": crate::util::hash_str(&p.diff),
                        });
                        self.record(run_id, RunStage::PatchGenerated, attempt, started, input.clone(), Ok(&output))?;
                        patch = Some(p);
                        break;
                    }
                    Err(err) => {
                        self.record(run_id, RunStage::PatchGenerated, attempt, started, input.clone(), Err(&err))?;
                        self.backoff_or_bail(err, attempt, max, "patch generation").await?;
                    }
                }
            }
            let Some(patch) = patch else {
                return Err(PipelineError::TransientInfra("generation attempts exhausted".into()));
            };
            audit.patch_generated(&patch.files, patch.lines_added, patch.lines_removed)?;
            patch
        };

        // ---- Apply in sandbox (sandbox execution: retryable) -----------
        let sandbox = {
            let input = json!({ "files": &patch.files, "lines": patch.total_lines_changed() });
            let mut sandbox = None;
            let max = self.config.retry.max_attempts;
            for attempt in 1..=max {
                self.check_cancel()?;
                let started = Utc::now();
                match self.apply_in_sandbox(run_id, &repo, &patch) {
                    Ok(sb) => {
                        let output = json!({ "sandbox": sb.path().display().to_string() });
                        self.record(run_id, RunStage::PatchApplied, attempt, started, input.clone(), Ok(&output))?;
                        audit.patch_applied(&sb.path().display().to_string())?;
                        sandbox = Some(sb);
                        break;
                    }
                    Err(err) => {
                        self.record(run_id, RunStage::PatchApplied, attempt, started, input.clone(), Err(&err))?;
                        self.backoff_or_bail(err, attempt, max, "sandbox apply").await?;
                    }
                }
            }
            let Some(sandbox) = sandbox else {
                return Err(PipelineError::TransientInfra("sandbox attempts exhausted".into()));
            };
            sandbox
        };

        // ---- Run checks ------------------------------------------------
        self.check_cancel()?;
        let results = {
            let started = Utc::now();
            let worktree = sandbox.path().to_path_buf();
            let project = detect_project_type(&worktree);
            let specs = validators_for(project, &self.config.validation);
            let input = json!({
                "project_type": project.name(),
                "checks": specs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            });

            let limits = self.config.sandbox.clone();
            let rules = self.config.sub_scores;
            let cancel = Arc::clone(&self.cancel);
            let task = tokio::task::spawn_blocking(move || {
                let outcome = sandbox.run_validators(&specs, &limits, &rules, &cancel);
                (sandbox, outcome)
            });
            let (sandbox_back, outcome) = task.await.map_err(|e| {
                PipelineError::TransientInfra(format!("validator task failed: {}", e))
            })?;
            let mut sandbox_back = sandbox_back;
            // Results captured (or not): the workspace goes away either way
            if let Err(cleanup_err) = sandbox_back.cleanup() {
                warn!(run_id = %run_id, error = %cleanup_err, "sandbox cleanup failed");
            }

            match outcome {
                Ok(results) => {
                    let output = json!({ "results": &results });
                    self.record(run_id, RunStage::ChecksRun, 1, started, input, Ok(&output))?;
                    for result in &results {
                        audit.check_executed(
                            result.kind.as_str(),
                            result.passed,
                            result.findings.len(),
                            result.timed_out,
                        )?;
                    }
                    results
                }
                Err(err) => {
                    self.record(run_id, RunStage::ChecksRun, 1, started, input, Err(&err))?;
                    return Err(err);
                }
            }
        };

        // ---- Score (pure, never retried) -------------------------------
        self.check_cancel()?;
        let outcome = {
            let started = Utc::now();
            let input = json!({
                "checks": results.iter().map(|r| r.kind.as_str()).collect::<Vec<_>>(),
                "files": &patch.files,
            });
            let engine = ScoringEngine::from_config(&self.config);
            let outcome = engine.compute(&results, &patch);
            self.store.set_scores(run_id, outcome.quality_score, outcome.risk_score)?;
            let output = json!({ "scoring": &outcome });
            self.record(run_id, RunStage::Scored, 1, started, input, Ok(&output))?;
            audit.decision_made(
                outcome.decision,
                outcome.quality_score,
                outcome.risk_score,
                &outcome.gate_failures,
                &outcome.risk_flags,
            )?;
            outcome
        };

        // ---- Explain (best-effort) -------------------------------------
        self.check_cancel()?;
        {
            let started = Utc::now();
            let summary = format_check_summary(&results);
            let input = json!({ "decision": outcome.decision.as_str() });
            let request = ExplainRequest {
                task_description: run.task_description.clone(),
                diff: patch.diff.clone(),
                check_summary: summary.clone(),
                quality_score: outcome.quality_score,
                risk_score: outcome.risk_score,
            };
            let (explanation, source) = match self.generator.explain(&request).await {
                Ok(text) => (text, "model"),
                Err(err) => {
                    debug!(run_id = %run_id, error = %err, "explanation degraded to fallback");
                    let fallback = format!(
                        "Patch touches {} file(s) (+{}/-{} lines).\n\nValidation:\n{}",
                        patch.files.len(),
                        patch.lines_added,
                        patch.lines_removed,
                        summary
                    );
                    (fallback, "fallback")
                }
            };
            let output = json!({ "explanation": explanation, "source": source });
            self.record(run_id, RunStage::Explained, 1, started, input, Ok(&output))?;
        }

        // ---- Finalize --------------------------------------------------
        {
            let started = Utc::now();
            let input = json!({ "decision": outcome.decision.as_str() });
            self.store.finalize(run_id, outcome.decision)?;
            let output = json!({ "decision": outcome.decision.as_str() });
            self.record(run_id, RunStage::Finalized, 1, started, input, Ok(&output))?;
            audit.run_finalized(Some(outcome.decision), None)?;
            info!(
                run_id = %run_id,
                decision = outcome.decision.as_str(),
                quality = outcome.quality_score,
                risk = outcome.risk_score,
                "run finalized"
            );
        }

        Ok(())
    }

    /// Verify the repo and capture its head. Failure here is a submission
    /// problem, not something a retry fixes.
    fn ingest(&self, run_id: Uuid, repo: &Path) -> Result<serde_json::Value, PipelineError> {
        if !repo.is_dir() {
            return Err(PipelineError::Stage {
                stage: "ingest",
                detail: format!("repository path does not exist: {}", repo.display()),
            });
        }

        let commit_sha = git_probe(repo, &["rev-parse", "HEAD"]);
        let branch = git_probe(repo, &["rev-parse", "--abbrev-ref", "HEAD"]);
        if commit_sha.is_none() {
            return Err(PipelineError::Stage {
                stage: "ingest",
                detail: format!("not a git repository: {}", repo.display()),
            });
        }

        let file_count = walkdir::WalkDir::new(repo)
            .into_iter()
            .filter_entry(|e| e.file_name().to_string_lossy() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count();

        self.store.set_repo_head(run_id, commit_sha.as_deref(), branch.as_deref())?;

        Ok(json!({
            "commit_sha": commit_sha,
            "branch": branch,
            "file_count": file_count,
        }))
    }

    /// Plan sanity checks that are terminal, not retryable
    fn validate_plan(&self, plan: ChangePlan, repo: &Path) -> Result<ChangePlan, PipelineError> {
        if plan.changes.len() > self.config.limits.max_files_per_run {
            return Err(PipelineError::Stage {
                stage: "plan",
                detail: format!(
                    "plan touches too many files: {} > {}",
                    plan.changes.len(),
                    self.config.limits.max_files_per_run
                ),
            });
        }
        for change in &plan.changes {
            let path = Path::new(&change.file_path);
            if path.is_absolute()
                || path.components().any(|c| matches!(c, Component::ParentDir))
            {
                return Err(PipelineError::Stage {
                    stage: "plan",
                    detail: format!("plan path escapes the repository: {}", change.file_path),
                });
            }
            if !repo.join(path).is_file() {
                return Err(PipelineError::Stage {
                    stage: "plan",
                    detail: format!("planned file not found: {}", change.file_path),
                });
            }
        }
        Ok(plan)
    }

    /// One full patch-generation attempt: a diff per planned change,
    /// concatenated, parsed and screened.
    async fn generate_patch(
        &self,
        repo: &Path,
        plan: &ChangePlan,
        _chunks: &[crate::retrieve::CodeChunk],
    ) -> Result<Patch, PipelineError> {
        let mut diffs = Vec::new();
        for change in &plan.changes {
            let full_path = repo.join(&change.file_path);
            let content = std::fs::read_to_string(&full_path).map_err(|e| PipelineError::Stage {
                stage: "generate",
                detail: format!("failed to read {}: {}", change.file_path, e),
            })?;

            let diff = self
                .generator
                .generate_diff(&change.file_path, &content, &change.description)
                .await
                .map_err(map_generation_error)?;
            diffs.push(diff);
        }

        let joined = diffs.join("\n\n");
        // An unparseable diff is the model's fault; retrying may produce a
        // clean one
        let patch = Patch::from_diff(&joined, &plan.rationale)
            .map_err(|e| PipelineError::TransientInfra(format!("generated diff unparseable: {}", e)))?;

        let screen = PatchScreen::new(&self.config.limits);
        let violations = screen.screen(&patch);
        if !violations.is_empty() {
            return Err(PipelineError::Stage {
                stage: "generate",
                detail: format!("patch failed screening: {}", violations.join("; ")),
            });
        }

        Ok(patch)
    }

    fn apply_in_sandbox(
        &self,
        run_id: Uuid,
        repo: &Path,
        patch: &Patch,
    ) -> Result<Sandbox, PipelineError> {
        let sandbox = Sandbox::create(repo, &run_id.to_string())?;
        sandbox.apply_patch(patch)?;
        Ok(sandbox)
    }

    /// Write one immutable stage record; successful stages advance the run.
    fn record(
        &self,
        run_id: Uuid,
        stage: RunStage,
        attempt: u32,
        started_at: DateTime<Utc>,
        input: serde_json::Value,
        outcome: Result<&serde_json::Value, &PipelineError>,
    ) -> Result<(), PipelineError> {
        let record = StageRecord {
            stage,
            status: if outcome.is_ok() { StageStatus::Succeeded } else { StageStatus::Failed },
            attempt,
            started_at,
            ended_at: Utc::now(),
            input: Some(input),
            output: outcome.ok().cloned(),
            error: outcome.err().map(|e| e.to_string()),
        };
        self.store.append_stage_record(run_id, &record)?;
        if record.status == StageStatus::Succeeded {
            self.store.advance_stage(run_id, stage)?;
            debug!(run_id = %run_id, stage = stage.as_str(), attempt, "stage succeeded");
        }
        Ok(())
    }

    /// After a failed attempt: sleep and continue when the error is
    /// transient and budget remains, otherwise propagate.
    async fn backoff_or_bail(
        &self,
        err: PipelineError,
        attempt: u32,
        max: u32,
        what: &str,
    ) -> Result<(), PipelineError> {
        if err.is_transient() && attempt < max {
            let delay = self.config.retry.delay_for_attempt(attempt);
            warn!(error = %err, attempt, max, "{} failed, retrying in {:?}", what, delay);
            tokio::time::sleep(delay).await;
            Ok(())
        } else {
            Err(err)
        }
    }

    fn check_cancel(&self) -> Result<(), PipelineError> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn map_generation_error(err: GenerationError) -> PipelineError {
    match err {
        GenerationError::Transient(msg) => PipelineError::TransientInfra(msg),
        GenerationError::Refused(msg) => PipelineError::GenerationRefused(msg),
    }
}

fn git_probe(repo: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo).args(args);
    let out = run_command_with_timeout(&mut cmd, GIT_PROBE_TIMEOUT, None).ok()?;
    if out.status.map(|s| s.success()).unwrap_or(false) {
        let value = out.stdout.trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::PlannedChange;
    use crate::retrieve::KeywordRetriever;
    use crate::run::Decision;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct StubGenerator {
        diff: String,
        plan_failures: Mutex<u32>,
        refuse: bool,
    }

    impl StubGenerator {
        fn with_diff(diff: &str) -> Self {
            Self { diff: diff.to_string(), plan_failures: Mutex::new(0), refuse: false }
        }
    }

    #[async_trait]
    impl PatchGenerator for StubGenerator {
        async fn plan_change(
            &self,
            _task_type: TaskType,
            task_description: &str,
            _context: &[crate::retrieve::CodeChunk],
        ) -> Result<ChangePlan, GenerationError> {
            if self.refuse {
                return Err(GenerationError::Refused("not doing that".to_string()));
            }
            let mut failures = self.plan_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(GenerationError::Transient("rate limited".to_string()));
            }
            Ok(ChangePlan {
                description: "stub plan".to_string(),
                files_to_modify: vec!["greet.py".to_string()],
                changes: vec![PlannedChange {
                    file_path: "greet.py".to_string(),
                    change_type: "modify".to_string(),
                    description: task_description.to_string(),
                }],
                rationale: "test rationale".to_string(),
                confidence: 0.9,
            })
        }

        async fn generate_diff(
            &self,
            _file_path: &str,
            _current_content: &str,
            _change_description: &str,
        ) -> Result<String, GenerationError> {
            Ok(self.diff.clone())
        }

        async fn explain(&self, _request: &ExplainRequest) -> Result<String, GenerationError> {
            Err(GenerationError::Transient("explainer offline".to_string()))
        }
    }

    fn git(repo: &Path, args: &[&str]) {
        let mut cmd = Command::new("git");
        cmd.current_dir(repo).args(args);
        let out = run_command_with_timeout(&mut cmd, Duration::from_secs(20), None).unwrap();
        assert!(
            out.status.map(|s| s.success()).unwrap_or(false),
            "git {:?} failed: {}",
            args,
            out.stderr
        );
    }

    fn setup_repo() -> (tempfile::TempDir, PathBuf) {
        let root = tempdir().unwrap();
        let repo = root.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init"]);
        git(&repo, &["config", "user.name", "Patchgate Test"]);
        git(&repo, &["config", "user.email", "patchgate@test.local"]);
        std::fs::write(repo.join("greet.py"), "def greet():\n    return \"hello\"\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "init"]);
        (root, repo)
    }

    fn good_diff() -> String {
        "--- a/greet.py\n+++ b/greet.py\n@@ -1,2 +1,2 @@\n def greet():\n-    return \"hello\"\n+    return \"hi\"\n"
            .to_string()
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.retry.base_delay_ms = 1;
        config
    }

    fn pipeline_with(generator: StubGenerator, config: Config) -> Pipeline {
        Pipeline::new(
            Arc::new(RunStore::open_in_memory().unwrap()),
            Arc::new(KeywordRetriever::new()),
            Arc::new(generator),
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn end_to_end_run_reaches_a_decision() {
        let (_tmp, repo) = setup_repo();
        let pipeline = pipeline_with(StubGenerator::with_diff(&good_diff()), fast_config());

        let run_id = pipeline
            .submit(&repo, TaskType::Refactor, "change the greeting")
            .unwrap();
        let run = pipeline.execute(run_id).await.unwrap();

        assert_eq!(run.stage, RunStage::Finalized);
        // No project markers in the fixture repo: every check is skipped,
        // which scores 0 and lands below the reject threshold
        assert_eq!(run.quality_score, Some(0.0));
        assert_eq!(run.decision, Some(Decision::Reject));

        // One record per stage, in order
        let stages: Vec<RunStage> = run.stage_records.iter().map(|r| r.stage).collect();
        assert_eq!(
            stages,
            vec![
                RunStage::Ingested,
                RunStage::ContextRetrieved,
                RunStage::PatchPlanned,
                RunStage::PatchGenerated,
                RunStage::PatchApplied,
                RunStage::ChecksRun,
                RunStage::Scored,
                RunStage::Explained,
                RunStage::Finalized,
            ]
        );
        assert!(run.stage_records.iter().all(|r| r.status == StageStatus::Succeeded));
        assert!(run.commit_sha.is_some());
    }

    #[tokio::test]
    async fn transient_plan_failures_are_retried_with_records() {
        let (_tmp, repo) = setup_repo();
        let generator = StubGenerator {
            diff: good_diff(),
            plan_failures: Mutex::new(2),
            refuse: false,
        };
        let pipeline = pipeline_with(generator, fast_config());

        let run_id = pipeline.submit(&repo, TaskType::Bugfix, "fix greeting").unwrap();
        let run = pipeline.execute(run_id).await.unwrap();

        assert_eq!(run.stage, RunStage::Finalized);
        let plan_records: Vec<&StageRecord> = run
            .stage_records
            .iter()
            .filter(|r| r.stage == RunStage::PatchPlanned)
            .collect();
        assert_eq!(plan_records.len(), 3);
        assert_eq!(plan_records[0].status, StageStatus::Failed);
        assert_eq!(plan_records[1].status, StageStatus::Failed);
        assert_eq!(plan_records[2].status, StageStatus::Succeeded);
        assert_eq!(plan_records[2].attempt, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let (_tmp, repo) = setup_repo();
        let generator = StubGenerator {
            diff: good_diff(),
            plan_failures: Mutex::new(99),
            refuse: false,
        };
        let pipeline = pipeline_with(generator, fast_config());

        let run_id = pipeline.submit(&repo, TaskType::Bugfix, "fix greeting").unwrap();
        let run = pipeline.execute(run_id).await.unwrap();

        assert_eq!(run.stage, RunStage::Failed);
        assert!(run.failure_reason.is_some());
        assert!(run.decision.is_none());
        let attempts = run
            .stage_records
            .iter()
            .filter(|r| r.stage == RunStage::PatchPlanned)
            .count();
        assert_eq!(attempts as u32, fast_config().retry.max_attempts);
    }

    #[tokio::test]
    async fn refusal_is_not_retried() {
        let (_tmp, repo) = setup_repo();
        let generator = StubGenerator {
            diff: good_diff(),
            plan_failures: Mutex::new(0),
            refuse: true,
        };
        let pipeline = pipeline_with(generator, fast_config());

        let run_id = pipeline.submit(&repo, TaskType::Review, "review this").unwrap();
        let run = pipeline.execute(run_id).await.unwrap();

        assert_eq!(run.stage, RunStage::Failed);
        let attempts = run
            .stage_records
            .iter()
            .filter(|r| r.stage == RunStage::PatchPlanned)
            .count();
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn unappliable_patch_fails_without_apply_retries() {
        let (_tmp, repo) = setup_repo();
        let bad_diff = "--- a/greet.py\n+++ b/greet.py\n@@ -1,2 +1,2 @@\n def nothing_like_this():\n-    return \"nope\"\n+    return \"still nope\"\n";
        let pipeline = pipeline_with(StubGenerator::with_diff(bad_diff), fast_config());

        let run_id = pipeline.submit(&repo, TaskType::Bugfix, "fix greeting").unwrap();
        let run = pipeline.execute(run_id).await.unwrap();

        assert_eq!(run.stage, RunStage::Failed);
        assert!(run.failure_reason.unwrap().contains("patch does not apply"));
        let apply_attempts = run
            .stage_records
            .iter()
            .filter(|r| r.stage == RunStage::PatchApplied)
            .count();
        assert_eq!(apply_attempts, 1);
    }

    #[tokio::test]
    async fn cancellation_fails_the_run_with_reason() {
        let (_tmp, repo) = setup_repo();
        let pipeline = pipeline_with(StubGenerator::with_diff(&good_diff()), fast_config());
        pipeline.cancel_flag().store(true, Ordering::SeqCst);

        let run_id = pipeline.submit(&repo, TaskType::Bugfix, "fix greeting").unwrap();
        let run = pipeline.execute(run_id).await.unwrap();

        assert_eq!(run.stage, RunStage::Failed);
        assert_eq!(run.failure_reason.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn missing_repo_fails_at_ingest() {
        let pipeline = pipeline_with(StubGenerator::with_diff(&good_diff()), fast_config());
        let run_id = pipeline
            .submit(Path::new("/definitely/not/a/repo"), TaskType::Bugfix, "fix")
            .unwrap();
        let run = pipeline.execute(run_id).await.unwrap();

        assert_eq!(run.stage, RunStage::Failed);
        assert_eq!(run.stage_records.len(), 1);
        assert_eq!(run.stage_records[0].stage, RunStage::Ingested);
        assert_eq!(run.stage_records[0].status, StageStatus::Failed);
    }

    #[test]
    fn bad_weights_are_a_startup_error() {
        let mut config = Config::default();
        config.weights.tests = 0.9; // sum now exceeds 1.0
        let result = Pipeline::new(
            Arc::new(RunStore::open_in_memory().unwrap()),
            Arc::new(KeywordRetriever::new()),
            Arc::new(StubGenerator::with_diff("y")),
            config,
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }
}
