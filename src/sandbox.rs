//! Isolated sandbox execution
//!
//! Each run gets a disposable detached git worktree under the temp dir.
//! Patches are applied there with `git apply` (fail fast on a dirty apply),
//! and validators run inside it as bounded subprocesses with a scrubbed,
//! no-egress environment. The workspace is destroyed on every exit path.

use crate::config::SandboxLimits;
use crate::diff::Patch;
use crate::error::PipelineError;
use crate::util::{run_command_with_timeout, tail_chars};
use crate::validate::{aggregate, RawOutcome, ValidationResult, ValidatorSpec};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

const GIT_WORKTREE_TIMEOUT: Duration = Duration::from_secs(60);
const GIT_APPLY_TIMEOUT: Duration = Duration::from_secs(30);

const SANDBOX_ROOT_DIR: &str = "patchgate-sandbox";

/// Disposable, isolated workspace for one run
#[derive(Debug)]
pub struct Sandbox {
    source_repo: PathBuf,
    run_root: PathBuf,
    worktree_path: PathBuf,
    cleaned: bool,
}

impl Sandbox {
    /// Create a detached git worktree in `$TMPDIR/patchgate-sandbox/<run_id>/workspace`.
    pub fn create(source_repo: &Path, run_id: &str) -> Result<Self, PipelineError> {
        let source_repo = source_repo.canonicalize().map_err(|e| {
            PipelineError::TransientInfra(format!(
                "Failed to resolve source repo '{}': {}",
                source_repo.display(),
                e
            ))
        })?;

        let run_root = std::env::temp_dir()
            .join(SANDBOX_ROOT_DIR)
            .join(sanitize_component(run_id));
        let worktree_path = run_root.join("workspace");

        std::fs::create_dir_all(&run_root).map_err(|e| {
            PipelineError::TransientInfra(format!(
                "Failed to create sandbox run directory '{}': {}",
                run_root.display(),
                e
            ))
        })?;

        if worktree_path.exists() {
            std::fs::remove_dir_all(&worktree_path).map_err(|e| {
                PipelineError::TransientInfra(format!(
                    "Failed to clear existing sandbox worktree '{}': {}",
                    worktree_path.display(),
                    e
                ))
            })?;
        }

        run_git(
            &source_repo,
            &["worktree", "add", "--detach", &worktree_path.to_string_lossy()],
            GIT_WORKTREE_TIMEOUT,
        )
        .map_err(PipelineError::TransientInfra)?;

        let sandbox = Self {
            source_repo,
            run_root,
            worktree_path,
            cleaned: false,
        };
        sandbox.verify_isolation()?;
        tracing::debug!(workspace = %sandbox.worktree_path.display(), "sandbox created");
        Ok(sandbox)
    }

    /// The isolation boundary must hold before anything executes: the
    /// workspace has to resolve under the sandbox root and outside the
    /// host checkout.
    fn verify_isolation(&self) -> Result<(), PipelineError> {
        let canon = self.worktree_path.canonicalize().map_err(|e| {
            PipelineError::SandboxIsolation(format!("workspace did not materialize: {}", e))
        })?;
        let temp_root = std::env::temp_dir()
            .canonicalize()
            .map_err(|e| PipelineError::SandboxIsolation(format!("temp dir unresolvable: {}", e)))?;

        if !canon.starts_with(&temp_root) {
            return Err(PipelineError::SandboxIsolation(format!(
                "workspace '{}' escaped the sandbox root",
                canon.display()
            )));
        }
        if canon.starts_with(&self.source_repo) {
            return Err(PipelineError::SandboxIsolation(format!(
                "workspace '{}' overlaps the source repository",
                canon.display()
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.worktree_path
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    /// Apply the patch inside the workspace. A diff that does not apply
    /// cleanly is a `PatchApplyError`: it is reported upward as a
    /// generation failure, never retried here.
    pub fn apply_patch(&self, patch: &Patch) -> Result<(), PipelineError> {
        let diff_path = self.run_root.join("patch.diff");
        // git apply wants the trailing newline
        let mut diff_text = patch.diff.clone();
        if !diff_text.ends_with('\n') {
            diff_text.push('\n');
        }
        std::fs::write(&diff_path, &diff_text)?;

        let check = run_git(
            &self.worktree_path,
            &["apply", "--check", &diff_path.to_string_lossy()],
            GIT_APPLY_TIMEOUT,
        );
        if let Err(err) = check {
            let _ = std::fs::remove_file(&diff_path);
            return Err(PipelineError::PatchApply(format!(
                "patch would not apply cleanly: {}",
                err
            )));
        }

        let applied = run_git(
            &self.worktree_path,
            &["apply", &diff_path.to_string_lossy()],
            GIT_APPLY_TIMEOUT,
        );
        let _ = std::fs::remove_file(&diff_path);
        applied.map_err(PipelineError::PatchApply)
    }

    /// Run every validator as an independent bounded subprocess.
    ///
    /// A slow check becomes a timed-out (failed) result that degrades the
    /// score; only cancellation aborts the batch.
    pub fn run_validators(
        &self,
        specs: &[ValidatorSpec],
        limits: &SandboxLimits,
        sub_rules: &crate::config::SubScoreRules,
        cancel: &AtomicBool,
    ) -> Result<Vec<ValidationResult>, PipelineError> {
        let overall_budget = Duration::from_secs(limits.overall_timeout_secs);
        let per_check = Duration::from_secs(limits.per_check_timeout_secs);
        let started = Instant::now();
        let mut results = Vec::with_capacity(specs.len());

        for spec in specs {
            let remaining = overall_budget.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                // Overall budget exhausted: the rest surface as timeouts
                results.push(timed_out_result(spec, sub_rules));
                continue;
            }

            let mut command = self.validator_command(spec, limits);
            let timeout = per_check.min(remaining);
            let start = Instant::now();
            let outcome = run_command_with_timeout(&mut command, timeout, Some(cancel));
            let duration_ms = start.elapsed().as_millis() as u64;

            let raw = match outcome {
                Ok(run) => {
                    if run.cancelled {
                        return Err(PipelineError::Cancelled);
                    }
                    RawOutcome {
                        exit_code: run.status.and_then(|s| s.code()),
                        stdout: run.stdout,
                        stderr: run.stderr,
                        duration_ms,
                        timed_out: run.timed_out,
                    }
                }
                // Tool missing or unstartable: captured as a failed check,
                // not a pipeline crash
                Err(e) => RawOutcome {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e,
                    duration_ms,
                    timed_out: false,
                },
            };

            let mut result = aggregate(spec, &raw, sub_rules);
            result.output = tail_chars(&result.output, limits.max_output_chars);
            results.push(result);
        }

        Ok(results)
    }

    fn validator_command(&self, spec: &ValidatorSpec, limits: &SandboxLimits) -> Command {
        let mut command = build_bounded_command(&spec.program, &spec.args, limits);
        command.current_dir(&self.worktree_path);

        command.env("GIT_TERMINAL_PROMPT", "0");
        command.env("GIT_ASKPASS", "/bin/true");

        if !limits.allow_network {
            for var in [
                "http_proxy",
                "https_proxy",
                "HTTP_PROXY",
                "HTTPS_PROXY",
                "ALL_PROXY",
                "all_proxy",
            ] {
                command.env_remove(var);
            }
            command.env("CARGO_NET_OFFLINE", "1");
            command.env("PIP_NO_INDEX", "1");
            command.env("GOPROXY", "off");
            command.env("npm_config_offline", "true");
        }

        command
    }

    /// Destroy the workspace. Idempotent; also invoked from Drop so no
    /// sandbox outlives its run.
    pub fn cleanup(&mut self) -> Result<(), String> {
        if self.cleaned {
            return Ok(());
        }
        if self.worktree_path.exists() {
            run_git(
                &self.source_repo,
                &["worktree", "remove", "--force", &self.worktree_path.to_string_lossy()],
                GIT_WORKTREE_TIMEOUT,
            )?;
        }
        // Prune any stale registration, then drop the run dir
        let _ = run_git(&self.source_repo, &["worktree", "prune"], GIT_WORKTREE_TIMEOUT);
        let _ = std::fs::remove_dir_all(&self.run_root);
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = self.cleanup();
        }
    }
}

/// Remove every leftover sandbox directory (e.g. after a crash) and prune
/// the repo's stale worktree registrations. Returns how many run dirs went.
pub fn cleanup_orphans(source_repo: &Path) -> Result<usize, String> {
    let root = std::env::temp_dir().join(SANDBOX_ROOT_DIR);
    let mut removed = 0;

    if root.is_dir() {
        let entries = std::fs::read_dir(&root)
            .map_err(|e| format!("Failed to read sandbox root '{}': {}", root.display(), e))?;
        for entry in entries.flatten() {
            if std::fs::remove_dir_all(entry.path()).is_ok() {
                removed += 1;
            }
        }
        let _ = std::fs::remove_dir(&root);
    }

    run_git(source_repo, &["worktree", "prune"], GIT_WORKTREE_TIMEOUT)?;
    Ok(removed)
}

/// Wrap the validator in best-effort resource caps where the host supports
/// them (cpu seconds / address space via ulimit on unix).
#[cfg(unix)]
fn build_bounded_command(program: &str, args: &[String], limits: &SandboxLimits) -> Command {
    if limits.cpu_seconds.is_none() && limits.memory_kb.is_none() {
        let mut command = Command::new(program);
        command.args(args);
        return command;
    }

    let mut script = String::new();
    if let Some(cpu) = limits.cpu_seconds {
        script.push_str(&format!("ulimit -t {} 2>/dev/null; ", cpu));
    }
    if let Some(mem) = limits.memory_kb {
        script.push_str(&format!("ulimit -v {} 2>/dev/null; ", mem));
    }
    script.push_str("exec \"$@\"");

    let mut command = Command::new("sh");
    command.arg("-c").arg(script).arg("sh").arg(program).args(args);
    command
}

#[cfg(not(unix))]
fn build_bounded_command(program: &str, args: &[String], _limits: &SandboxLimits) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    command
}

fn timed_out_result(
    spec: &ValidatorSpec,
    sub_rules: &crate::config::SubScoreRules,
) -> ValidationResult {
    let raw = RawOutcome {
        exit_code: None,
        stdout: String::new(),
        stderr: "overall sandbox budget exhausted".to_string(),
        duration_ms: 0,
        timed_out: true,
    };
    aggregate(spec, &raw, sub_rules)
}

fn run_git(repo_dir: &Path, args: &[&str], timeout: Duration) -> Result<(), String> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_dir).args(args);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.env("GIT_ASKPASS", "/bin/true");

    let output = run_command_with_timeout(&mut cmd, timeout, None)
        .map_err(|e| format!("Failed to run git command: {}", e))?;

    if output.timed_out {
        return Err(format!(
            "git command timed out after {}s: git {}",
            timeout.as_secs(),
            args.join(" ")
        ));
    }

    if output.status.map(|s| s.success()).unwrap_or(false) {
        return Ok(());
    }

    Err(format!(
        "git {} failed:\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        output.stdout,
        output.stderr
    ))
}

fn sanitize_component(input: &str) -> String {
    let cleaned = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .collect::<String>();
    if cleaned.is_empty() {
        "run".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubScoreRules;
    use crate::validate::{CheckKind, OutputParser};
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, PathBuf) {
        let root = tempdir().unwrap();
        let repo = root.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();

        run_git_for_test(&repo, &["init"]).unwrap();
        run_git_for_test(&repo, &["config", "user.name", "Patchgate Test"]).unwrap();
        run_git_for_test(&repo, &["config", "user.email", "patchgate@test.local"]).unwrap();
        std::fs::write(repo.join("hello.txt"), "hello\nworld\n").unwrap();
        run_git_for_test(&repo, &["add", "."]).unwrap();
        run_git_for_test(&repo, &["commit", "-m", "init"]).unwrap();

        (root, repo)
    }

    fn run_git_for_test(repo: &Path, args: &[&str]) -> Result<(), String> {
        let mut cmd = Command::new("git");
        cmd.current_dir(repo).args(args);
        let out = run_command_with_timeout(&mut cmd, Duration::from_secs(20), None)
            .map_err(|e| e.to_string())?;
        if out.status.map(|s| s.success()).unwrap_or(false) {
            Ok(())
        } else {
            Err(format!(
                "git {} failed:\nstdout:{}\nstderr:{}",
                args.join(" "),
                out.stdout,
                out.stderr
            ))
        }
    }

    fn hello_patch() -> Patch {
        let diff = "--- a/hello.txt\n+++ b/hello.txt\n@@ -1,2 +1,2 @@\n hello\n-world\n+sandbox\n";
        Patch::from_diff(diff, "swap greeting").unwrap()
    }

    fn shell_spec(kind: CheckKind, script: &str) -> ValidatorSpec {
        ValidatorSpec {
            kind,
            name: format!("sh -c {}", script),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            parser: OutputParser::ExitCodeOnly,
        }
    }

    #[test]
    fn sandbox_lifecycle_creates_and_cleans_worktree() {
        let (_tmp, repo) = setup_repo();
        let mut sandbox = Sandbox::create(&repo, "run-lifecycle").unwrap();
        assert!(sandbox.path().exists());

        std::fs::write(sandbox.path().join("sandbox-only.txt"), "tmp").unwrap();
        assert!(!repo.join("sandbox-only.txt").exists());

        sandbox.cleanup().unwrap();
        assert!(!sandbox.path().exists());
        assert!(!sandbox.run_root().exists());
    }

    #[test]
    fn drop_tears_down_workspace() {
        let (_tmp, repo) = setup_repo();
        let path;
        {
            let sandbox = Sandbox::create(&repo, "run-drop").unwrap();
            path = sandbox.path().to_path_buf();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn apply_patch_changes_sandbox_not_host() {
        let (_tmp, repo) = setup_repo();
        let mut sandbox = Sandbox::create(&repo, "run-apply").unwrap();

        sandbox.apply_patch(&hello_patch()).unwrap();

        let patched = std::fs::read_to_string(sandbox.path().join("hello.txt")).unwrap();
        assert!(patched.contains("sandbox"));
        let host = std::fs::read_to_string(repo.join("hello.txt")).unwrap();
        assert!(host.contains("world"));

        sandbox.cleanup().unwrap();
    }

    #[test]
    fn dirty_patch_fails_fast_with_patch_apply_error() {
        let (_tmp, repo) = setup_repo();
        let mut sandbox = Sandbox::create(&repo, "run-dirty").unwrap();

        let diff = "--- a/hello.txt\n+++ b/hello.txt\n@@ -1,2 +1,2 @@\n no-such-context\n-missing\n+nope\n";
        let patch = Patch::from_diff(diff, "").unwrap();
        let err = sandbox.apply_patch(&patch).unwrap_err();
        assert!(matches!(err, PipelineError::PatchApply(_)));
        assert!(!err.is_transient());

        sandbox.cleanup().unwrap();
    }

    #[test]
    fn validators_capture_exit_codes_and_output() {
        let (_tmp, repo) = setup_repo();
        let mut sandbox = Sandbox::create(&repo, "run-checks").unwrap();
        let cancel = AtomicBool::new(false);

        let specs = vec![
            shell_spec(CheckKind::Tests, "echo all good"),
            shell_spec(CheckKind::Lint, "echo broken >&2; exit 3"),
        ];
        let results = sandbox
            .run_validators(&specs, &SandboxLimits::default(), &SubScoreRules::default(), &cancel)
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert!(results[0].output.contains("all good"));
        assert!(!results[1].passed);
        assert!(results[1].output.contains("broken"));

        sandbox.cleanup().unwrap();
    }

    #[test]
    fn slow_validator_times_out_instead_of_hanging() {
        let (_tmp, repo) = setup_repo();
        let mut sandbox = Sandbox::create(&repo, "run-slow").unwrap();
        let cancel = AtomicBool::new(false);

        let mut limits = SandboxLimits::default();
        limits.per_check_timeout_secs = 1;
        let specs = vec![shell_spec(CheckKind::Lint, "sleep 30")];
        let results = sandbox
            .run_validators(&specs, &limits, &SubScoreRules::default(), &cancel)
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].timed_out);
        assert!(!results[0].passed);

        sandbox.cleanup().unwrap();
    }

    #[test]
    fn missing_tool_is_a_failed_check_not_a_crash() {
        let (_tmp, repo) = setup_repo();
        let mut sandbox = Sandbox::create(&repo, "run-missing").unwrap();
        let cancel = AtomicBool::new(false);

        let spec = ValidatorSpec {
            kind: CheckKind::Lint,
            name: "definitely-not-installed".to_string(),
            program: "definitely-not-installed-tool".to_string(),
            args: vec![],
            parser: OutputParser::ExitCodeOnly,
        };
        let results = sandbox
            .run_validators(&[spec], &SandboxLimits::default(), &SubScoreRules::default(), &cancel)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);

        sandbox.cleanup().unwrap();
    }

    #[test]
    fn cancellation_aborts_the_batch() {
        let (_tmp, repo) = setup_repo();
        let mut sandbox = Sandbox::create(&repo, "run-cancel").unwrap();
        let cancel = AtomicBool::new(true);

        let specs = vec![shell_spec(CheckKind::Tests, "sleep 30")];
        let err = sandbox
            .run_validators(&specs, &SandboxLimits::default(), &SubScoreRules::default(), &cancel)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));

        sandbox.cleanup().unwrap();
    }
}
