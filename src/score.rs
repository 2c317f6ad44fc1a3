//! Deterministic quality/risk scoring and the decision rule
//!
//! Given the normalized check results and the patch metadata, computes a
//! quality score (0-100), a risk score (0.0-1.0) and the terminal decision.
//! Hard gates are evaluated before any threshold; identical inputs always
//! produce identical outputs.

use crate::config::{RiskConfig, ScoringThresholds, ScoringWeights, StepRule, SubScoreRules};
use crate::diff::Patch;
use crate::run::Decision;
use crate::validate::{is_source_path, is_test_path, CheckKind, ValidationResult, ALL_CHECKS};
use serde::Serialize;
use std::path::Path;

/// Individual check sub-scores that make up the quality score
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckScores {
    pub tests: f64,
    pub typecheck: f64,
    pub security: f64,
    pub lint: f64,
    pub format: f64,
}

impl CheckScores {
    fn get(&self, kind: CheckKind) -> f64 {
        match kind {
            CheckKind::Tests => self.tests,
            CheckKind::Typecheck => self.typecheck,
            CheckKind::Security => self.security,
            CheckKind::Lint => self.lint,
            CheckKind::Format => self.format,
        }
    }

    fn set(&mut self, kind: CheckKind, value: f64) {
        match kind {
            CheckKind::Tests => self.tests = value,
            CheckKind::Typecheck => self.typecheck = value,
            CheckKind::Security => self.security = value,
            CheckKind::Lint => self.lint = value,
            CheckKind::Format => self.format = value,
        }
    }
}

/// One risk factor's contribution, kept for the audit payload
#[derive(Debug, Clone, Serialize)]
pub struct RiskFactor {
    pub name: &'static str,
    /// Raw factor value in [0, 1]
    pub value: f64,
    /// Maximum contribution this factor may make
    pub cap: f64,
    /// value * cap
    pub contribution: f64,
    pub flags: Vec<String>,
}

/// Everything the scoring stage produces
#[derive(Debug, Clone, Serialize)]
pub struct ScoringOutcome {
    pub quality_score: f64,
    pub risk_score: f64,
    pub decision: Decision,
    pub check_scores: CheckScores,
    pub risk_factors: Vec<RiskFactor>,
    pub gate_failures: Vec<String>,
    pub risk_flags: Vec<String>,
}

/// Pure scoring over check results and diff metadata. All weights,
/// thresholds and risk parameters arrive by value so callers can score
/// under arbitrary policies.
pub struct ScoringEngine {
    weights: ScoringWeights,
    thresholds: ScoringThresholds,
    risk: RiskConfig,
    sub_rules: SubScoreRules,
    max_files_per_run: usize,
}

impl ScoringEngine {
    pub fn new(
        weights: ScoringWeights,
        thresholds: ScoringThresholds,
        risk: RiskConfig,
        sub_rules: SubScoreRules,
        max_files_per_run: usize,
    ) -> Self {
        Self { weights, thresholds, risk, sub_rules, max_files_per_run }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.weights,
            config.thresholds,
            config.risk.clone(),
            config.sub_scores,
            config.limits.max_files_per_run,
        )
    }

    pub fn compute(&self, results: &[ValidationResult], patch: &Patch) -> ScoringOutcome {
        let check_scores = self.check_scores(results);
        let quality_score = self.quality_score(&check_scores);
        let risk_factors = self.risk_factors(patch);
        let risk_score = combine_risk(&risk_factors);
        let risk_flags: Vec<String> =
            risk_factors.iter().flat_map(|f| f.flags.iter().cloned()).collect();

        let gate_failures = self.gate_failures(results, patch);
        let decision = self.decide(quality_score, risk_score, &gate_failures);

        ScoringOutcome {
            quality_score,
            risk_score,
            decision,
            check_scores,
            risk_factors,
            gate_failures,
            risk_flags,
        }
    }

    /// A check that never ran scores 0 at full weight; the denominator
    /// always covers the whole check set.
    fn check_scores(&self, results: &[ValidationResult]) -> CheckScores {
        let mut scores = CheckScores { tests: 0.0, typecheck: 0.0, security: 0.0, lint: 0.0, format: 0.0 };
        for kind in ALL_CHECKS {
            let result = results.iter().find(|r| r.kind == kind);
            let score = match result {
                Some(r) => r.sub_score.unwrap_or_else(|| {
                    crate::validate::sub_score(
                        kind,
                        r.passed,
                        r.error_count(),
                        r.warning_count(),
                        &self.sub_rules,
                    )
                }),
                None => 0.0,
            };
            scores.set(kind, score.clamp(0.0, 100.0));
        }
        scores
    }

    fn quality_score(&self, scores: &CheckScores) -> f64 {
        let weighted = scores.get(CheckKind::Tests) * self.weights.tests
            + scores.get(CheckKind::Typecheck) * self.weights.typecheck
            + scores.get(CheckKind::Security) * self.weights.security
            + scores.get(CheckKind::Lint) * self.weights.lint
            + scores.get(CheckKind::Format) * self.weights.format;
        round2(weighted.clamp(0.0, 100.0))
    }

    fn risk_factors(&self, patch: &Patch) -> Vec<RiskFactor> {
        vec![
            self.diff_size_factor(patch),
            self.sensitive_path_factor(patch),
            self.missing_tests_factor(patch),
            self.complexity_factor(patch),
            self.dependency_factor(patch),
        ]
    }

    fn diff_size_factor(&self, patch: &Patch) -> RiskFactor {
        let total = patch.total_lines_changed();
        let value = step_value(&self.risk.diff_size_steps, total);

        let mut flags = Vec::new();
        if value >= 0.7 {
            flags.push(format!("Large diff: {} lines changed", total));
        }

        factor("diff_size", value, self.risk.diff_size_cap, flags)
    }

    fn sensitive_path_factor(&self, patch: &Patch) -> RiskFactor {
        let mut max_value: f64 = 0.0;
        let mut flags = Vec::new();

        for file in &patch.files {
            let lower = file.to_lowercase();

            for prefix in &self.risk.sensitive_paths {
                if lower.contains(prefix.trim_end_matches('/')) {
                    flags.push(format!("Sensitive path: {}", file));
                    max_value = max_value.max(self.risk.sensitive_path_value);
                }
            }

            for keyword in &self.risk.sensitive_keywords {
                if lower.contains(keyword.as_str()) {
                    flags.push(format!("Sensitive keyword in path: {}", file));
                    max_value = max_value.max(self.risk.sensitive_keyword_value);
                }
            }
        }

        flags.sort();
        flags.dedup();
        factor("sensitive_paths", max_value, self.risk.sensitive_path_cap, flags)
    }

    fn missing_tests_factor(&self, patch: &Patch) -> RiskFactor {
        let source_changed = patch.files.iter().any(|f| is_source_path(f));
        let tests_changed = patch.files.iter().any(|f| is_test_path(f));

        let mut flags = Vec::new();
        let value = if source_changed && !tests_changed {
            flags.push("Source changes without test updates".to_string());
            self.risk.missing_tests_value
        } else {
            0.0
        };

        factor("test_coverage", value, self.risk.missing_tests_cap, flags)
    }

    /// Control-flow keywords added minus removed, as a cheap complexity delta
    fn complexity_factor(&self, patch: &Patch) -> RiskFactor {
        let added = count_control_structures(&patch.added_lines());
        let removed = count_control_structures(&patch.removed_lines());
        let delta = added.saturating_sub(removed);

        let value = step_value(&self.risk.complexity_steps, delta);
        let mut flags = Vec::new();
        if value >= 0.7 {
            flags.push(format!("High complexity change: +{} control structures", delta));
        }

        factor("complexity", value, self.risk.complexity_cap, flags)
    }

    fn dependency_factor(&self, patch: &Patch) -> RiskFactor {
        let mut max_value: f64 = 0.0;
        let mut flags = Vec::new();

        for file in &patch.files {
            let name = Path::new(file).file_name().and_then(|f| f.to_str()).unwrap_or("");
            if self.risk.dependency_lockfiles.iter().any(|l| l == name) {
                flags.push(format!("Lockfile changed: {}", name));
                max_value = max_value.max(self.risk.dependency_lockfile_value);
            } else if self.risk.dependency_manifests.iter().any(|m| m == name) {
                flags.push(format!("Dependency manifest changed: {}", name));
                max_value = max_value.max(self.risk.dependency_manifest_value);
            }
        }

        factor("dependencies", max_value, self.risk.dependency_cap, flags)
    }

    /// Gates come before thresholds: any unresolved hard-gate failure is a
    /// rejection no matter what the scores say.
    fn gate_failures(&self, results: &[ValidationResult], patch: &Patch) -> Vec<String> {
        let mut failures = Vec::new();

        for result in results {
            if result.hard_gate && !result.passed {
                match result.kind {
                    CheckKind::Tests => failures.push("Tests failed".to_string()),
                    CheckKind::Security => {
                        failures.push("Security findings at blocking severity".to_string())
                    }
                    other => failures.push(format!("{} hard gate failed", other.as_str())),
                }
            }
        }

        if patch.files.len() > self.max_files_per_run {
            failures.push(format!(
                "Too many files touched: {} > {}",
                patch.files.len(),
                self.max_files_per_run
            ));
        }

        failures
    }

    fn decide(&self, quality: f64, risk: f64, gate_failures: &[String]) -> Decision {
        if !gate_failures.is_empty() {
            return Decision::Reject;
        }
        if risk >= self.thresholds.risk_reject {
            return Decision::Reject;
        }
        if risk >= self.thresholds.risk_review {
            return Decision::NeedsReview;
        }
        if quality < self.thresholds.quality_review {
            return Decision::Reject;
        }
        if quality < self.thresholds.quality_approve {
            return Decision::NeedsReview;
        }
        Decision::AutoApprove
    }
}

fn factor(name: &'static str, value: f64, cap: f64, flags: Vec<String>) -> RiskFactor {
    let value = value.clamp(0.0, 1.0);
    RiskFactor { name, value, cap, contribution: value * cap, flags }
}

/// Bounded sum of capped contributions, clamped to [0, 1]
fn combine_risk(factors: &[RiskFactor]) -> f64 {
    let sum: f64 = factors.iter().map(|f| f.contribution).sum();
    round3(sum.clamp(0.0, 1.0))
}

/// Highest step whose `over` threshold is exceeded wins; below every step
/// the factor is 0.
fn step_value(steps: &[StepRule], measured: usize) -> f64 {
    let mut value: f64 = 0.0;
    for step in steps {
        if measured > step.over {
            value = value.max(step.value);
        }
    }
    value
}

fn count_control_structures(lines: &[&str]) -> usize {
    const KEYWORDS: [&str; 10] = [
        "if ", "else", "elif ", "for ", "while ", "match ", "try", "except ", "catch", "with ",
    ];
    lines
        .iter()
        .map(|line| KEYWORDS.iter().filter(|kw| line.contains(*kw)).count())
        .sum()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::validate::{Finding, Severity};

    fn engine() -> ScoringEngine {
        ScoringEngine::from_config(&Config::default())
    }

    fn check(kind: CheckKind, passed: bool, sub_score: f64) -> ValidationResult {
        ValidationResult {
            kind,
            passed,
            hard_gate: kind == CheckKind::Tests && !passed,
            sub_score: Some(sub_score),
            findings: Vec::new(),
            output: String::new(),
            duration_ms: 5,
            timed_out: false,
        }
    }

    fn all_green() -> Vec<ValidationResult> {
        ALL_CHECKS.iter().map(|&k| check(k, true, 100.0)).collect()
    }

    fn small_patch() -> Patch {
        Patch {
            diff: "--- a/src/app.py\n+++ b/src/app.py\n@@ -1,5 +1,5 @@\n-old\n+new\n".to_string(),
            files: vec!["src/app.py".to_string()],
            lines_added: 5,
            lines_removed: 5,
            rationale: String::new(),
        }
    }

    #[test]
    fn test_all_green_small_diff_auto_approves() {
        let outcome = engine().compute(&all_green(), &small_patch());
        assert_eq!(outcome.quality_score, 100.0);
        assert!(outcome.risk_score < 0.3);
        assert_eq!(outcome.decision, Decision::AutoApprove);
    }

    #[test]
    fn test_hard_gate_forces_reject_despite_high_quality() {
        let mut results = all_green();
        results[0] = check(CheckKind::Tests, false, 0.0);
        results[0].hard_gate = true;

        let outcome = engine().compute(&results, &small_patch());
        // quality is still decent (everything except tests is perfect)
        assert!(outcome.quality_score >= 60.0);
        assert_eq!(outcome.decision, Decision::Reject);
        assert!(outcome.gate_failures.iter().any(|g| g == "Tests failed"));
    }

    #[test]
    fn test_security_gate_forces_reject() {
        let mut results = all_green();
        results[4] = ValidationResult {
            kind: CheckKind::Security,
            passed: false,
            hard_gate: true,
            sub_score: Some(75.0),
            findings: vec![Finding {
                severity: Severity::Error,
                file: "src/auth.py".to_string(),
                line: 3,
                message: "hardcoded credential".to_string(),
                rule: "secrets".to_string(),
            }],
            output: String::new(),
            duration_ms: 5,
            timed_out: false,
        };
        let outcome = engine().compute(&results, &small_patch());
        assert_eq!(outcome.decision, Decision::Reject);
    }

    #[test]
    fn test_skipped_check_scores_zero_not_omitted() {
        // Only tests ran: quality = 100 * 0.40, the other weights score 0
        let results = vec![check(CheckKind::Tests, true, 100.0)];
        let outcome = engine().compute(&results, &small_patch());
        assert_eq!(outcome.quality_score, 40.0);
        assert_eq!(outcome.check_scores.lint, 0.0);
        assert_eq!(outcome.check_scores.security, 0.0);
    }

    #[test]
    fn test_quality_is_monotonic_in_single_check() {
        let e = engine();
        let patch = small_patch();
        let mut low = all_green();
        low[1] = check(CheckKind::Lint, true, 40.0);
        let mut high = all_green();
        high[1] = check(CheckKind::Lint, true, 80.0);

        let q_low = e.compute(&low, &patch).quality_score;
        let q_high = e.compute(&high, &patch).quality_score;
        assert!(q_high > q_low);
    }

    #[test]
    fn test_sensitive_path_and_size_push_into_review() {
        // auth path + 250 changed lines + no test updates
        let mut diff = String::from("--- a/auth/login.py\n+++ b/auth/login.py\n@@ -1,125 +1,125 @@\n");
        for i in 0..125 {
            diff.push_str(&format!("-old {}\n+new {}\n", i, i));
        }
        let patch = Patch::from_diff(&diff, "").unwrap();
        assert_eq!(patch.total_lines_changed(), 250);

        let outcome = engine().compute(&all_green(), &patch);
        // sensitive (0.9 * 0.25) + size (0.7 * 0.15) + missing tests (0.5 * 0.20)
        assert!(outcome.risk_score >= 0.3, "risk {} should reach review", outcome.risk_score);
        assert_ne!(outcome.decision, Decision::AutoApprove);
        assert!(outcome.risk_flags.iter().any(|f| f.contains("auth/login.py")));
    }

    #[test]
    fn test_risk_is_bounded_and_caps_hold() {
        // Worst case on every axis
        let mut diff = String::from("--- a/auth/secrets/Cargo.lock\n+++ b/auth/secrets/Cargo.lock\n@@ -1,1 +1,600 @@\n");
        for i in 0..600 {
            diff.push_str(&format!("+if x {{ for y {{ while z {{ }} }} }} # {}\n", i));
        }
        let patch = Patch::from_diff(&diff, "").unwrap();
        let outcome = engine().compute(&[], &patch);

        assert!(outcome.risk_score <= 1.0);
        assert!(outcome.risk_score >= 0.0);
        for f in &outcome.risk_factors {
            assert!(f.contribution <= f.cap + 1e-9, "{} exceeds its cap", f.name);
            assert!(f.value <= 1.0);
        }
    }

    #[test]
    fn test_dependency_manifest_raises_risk() {
        let diff = "--- a/Cargo.toml\n+++ b/Cargo.toml\n@@ -1,1 +1,2 @@\n [dependencies]\n+serde = \"1\"\n";
        let patch = Patch::from_diff(diff, "").unwrap();
        let outcome = engine().compute(&all_green(), &patch);
        let dep = outcome.risk_factors.iter().find(|f| f.name == "dependencies").unwrap();
        assert!(dep.contribution > 0.0);
        assert!(outcome.risk_flags.iter().any(|f| f.contains("Cargo.toml")));
    }

    #[test]
    fn test_too_many_files_is_a_gate() {
        let mut patch = small_patch();
        patch.files = (0..11).map(|i| format!("src/mod_{}.py", i)).collect();
        let outcome = engine().compute(&all_green(), &patch);
        assert_eq!(outcome.decision, Decision::Reject);
        assert!(outcome.gate_failures.iter().any(|g| g.contains("Too many files")));
    }

    #[test]
    fn test_low_quality_rejects_without_gates() {
        let results: Vec<ValidationResult> =
            ALL_CHECKS.iter().map(|&k| check(k, true, 30.0)).collect();
        let outcome = engine().compute(&results, &small_patch());
        assert_eq!(outcome.quality_score, 30.0);
        assert_eq!(outcome.decision, Decision::Reject);
        assert!(outcome.gate_failures.is_empty());
    }

    #[test]
    fn test_middling_quality_needs_review() {
        let results: Vec<ValidationResult> =
            ALL_CHECKS.iter().map(|&k| check(k, true, 70.0)).collect();
        let outcome = engine().compute(&results, &small_patch());
        assert_eq!(outcome.decision, Decision::NeedsReview);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let e = engine();
        let results = all_green();
        let patch = small_patch();
        let a = e.compute(&results, &patch);
        let b = e.compute(&results, &patch);
        assert_eq!(a.quality_score, b.quality_score);
        assert_eq!(a.risk_score, b.risk_score);
        assert_eq!(a.decision, b.decision);
    }

    #[test]
    fn test_custom_thresholds_are_respected() {
        let mut config = Config::default();
        config.thresholds.quality_approve = 99.0;
        let e = ScoringEngine::from_config(&config);
        let results: Vec<ValidationResult> =
            ALL_CHECKS.iter().map(|&k| check(k, true, 95.0)).collect();
        let outcome = e.compute(&results, &small_patch());
        // 95 < 99 now lands in review instead of approve
        assert_eq!(outcome.decision, Decision::NeedsReview);
    }
}
