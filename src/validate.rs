//! Validator execution plans and output aggregation
//!
//! Detects the project type, builds the per-check command table, and
//! normalizes heterogeneous tool output into a common result shape.
//! Aggregation is pure: identical raw output always produces the identical
//! `ValidationResult`, and unparseable output becomes a `parse_error`
//! finding rather than silently dropped data.

use crate::config::{SubScoreRules, ValidationToggles};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The fixed check vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Tests,
    Lint,
    Format,
    Typecheck,
    Security,
}

/// Every check kind, in scoring order
pub const ALL_CHECKS: [CheckKind; 5] = [
    CheckKind::Tests,
    CheckKind::Lint,
    CheckKind::Format,
    CheckKind::Typecheck,
    CheckKind::Security,
];

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Tests => "tests",
            CheckKind::Lint => "lint",
            CheckKind::Format => "format",
            CheckKind::Typecheck => "typecheck",
            CheckKind::Security => "security",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

/// One structured issue reported by a validator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub file: String,
    pub line: u32,
    pub message: String,
    pub rule: String,
}

/// Normalized outcome of one check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub kind: CheckKind,
    pub passed: bool,
    /// A failed hard-gate check forces rejection regardless of scores
    pub hard_gate: bool,
    /// 0-100; None when the check produced nothing scoreable (e.g. timeout)
    pub sub_score: Option<f64>,
    pub findings: Vec<Finding>,
    /// Combined stdout/stderr, truncated for storage
    pub output: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ValidationResult {
    pub fn error_count(&self) -> usize {
        self.findings.iter().filter(|f| f.severity == Severity::Error).count()
    }

    pub fn warning_count(&self) -> usize {
        self.findings.iter().filter(|f| f.severity == Severity::Warning).count()
    }
}

/// Detected project type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Rust,
    Node,
    Python,
    Go,
    Unknown,
}

impl ProjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectType::Rust => "Rust",
            ProjectType::Node => "Node.js",
            ProjectType::Python => "Python",
            ProjectType::Go => "Go",
            ProjectType::Unknown => "Unknown",
        }
    }
}

/// Detect project type from files in directory
pub fn detect_project_type(repo_path: &Path) -> ProjectType {
    if repo_path.join("Cargo.toml").exists() {
        ProjectType::Rust
    } else if repo_path.join("package.json").exists() {
        ProjectType::Node
    } else if repo_path.join("pyproject.toml").exists()
        || repo_path.join("setup.py").exists()
        || repo_path.join("requirements.txt").exists()
    {
        ProjectType::Python
    } else if repo_path.join("go.mod").exists() {
        ProjectType::Go
    } else {
        ProjectType::Unknown
    }
}

/// How to interpret a validator's raw output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputParser {
    PytestSummary,
    RuffJson,
    MypyText,
    SemgrepJson,
    CargoText,
    ExitCodeOnly,
}

/// One validator to run inside the sandbox
#[derive(Debug, Clone)]
pub struct ValidatorSpec {
    pub kind: CheckKind,
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub parser: OutputParser,
}

impl ValidatorSpec {
    fn new(kind: CheckKind, program: &str, args: &[&str], parser: OutputParser) -> Self {
        Self {
            kind,
            name: format!("{} {}", program, args.join(" ")).trim().to_string(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            parser,
        }
    }
}

/// Build the check table for a project type. Kinds with no tool for the
/// detected language are simply absent; scoring treats them as 0.
pub fn validators_for(project: ProjectType, toggles: &ValidationToggles) -> Vec<ValidatorSpec> {
    use CheckKind::*;
    use OutputParser::*;

    let mut specs = Vec::new();
    match project {
        ProjectType::Rust => {
            if toggles.run_lint {
                specs.push(ValidatorSpec::new(Lint, "cargo", &["clippy", "-q", "--no-deps"], CargoText));
            }
            if toggles.run_format {
                specs.push(ValidatorSpec::new(Format, "cargo", &["fmt", "--", "--check"], ExitCodeOnly));
            }
            if toggles.run_typecheck {
                specs.push(ValidatorSpec::new(Typecheck, "cargo", &["check", "-q"], CargoText));
            }
            if toggles.run_tests {
                specs.push(ValidatorSpec::new(Tests, "cargo", &["test", "-q"], ExitCodeOnly));
            }
        }
        ProjectType::Python => {
            if toggles.run_lint {
                specs.push(ValidatorSpec::new(
                    Lint,
                    "ruff",
                    &["check", ".", "--output-format=json"],
                    RuffJson,
                ));
            }
            if toggles.run_format {
                specs.push(ValidatorSpec::new(Format, "ruff", &["format", "--check", "."], ExitCodeOnly));
            }
            if toggles.run_typecheck {
                specs.push(ValidatorSpec::new(
                    Typecheck,
                    "mypy",
                    &[".", "--no-error-summary"],
                    MypyText,
                ));
            }
            if toggles.run_security {
                specs.push(ValidatorSpec::new(
                    Security,
                    "semgrep",
                    &["--config", "auto", "--json", "--no-git-ignore", "."],
                    SemgrepJson,
                ));
            }
            if toggles.run_tests {
                specs.push(ValidatorSpec::new(
                    Tests,
                    "pytest",
                    &["-q", "--tb=short", "--no-header"],
                    PytestSummary,
                ));
            }
        }
        ProjectType::Node => {
            if toggles.run_tests {
                specs.push(ValidatorSpec::new(Tests, "npm", &["test"], ExitCodeOnly));
            }
        }
        ProjectType::Go => {
            if toggles.run_typecheck {
                specs.push(ValidatorSpec::new(Typecheck, "go", &["vet", "./..."], ExitCodeOnly));
            }
            if toggles.run_format {
                specs.push(ValidatorSpec::new(Format, "gofmt", &["-l", "."], ExitCodeOnly));
            }
            if toggles.run_tests {
                specs.push(ValidatorSpec::new(Tests, "go", &["test", "./..."], ExitCodeOnly));
            }
        }
        ProjectType::Unknown => {}
    }
    specs
}

/// Raw capture from one validator subprocess
#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Normalize one raw outcome into a ValidationResult.
pub fn aggregate(spec: &ValidatorSpec, raw: &RawOutcome, rules: &SubScoreRules) -> ValidationResult {
    let combined = combine_output(&raw.stdout, &raw.stderr);

    if raw.timed_out {
        let finding = Finding {
            severity: Severity::Error,
            file: String::new(),
            line: 0,
            message: format!("{} timed out", spec.name),
            rule: "timeout".to_string(),
        };
        return ValidationResult {
            kind: spec.kind,
            passed: false,
            hard_gate: spec.kind == CheckKind::Tests,
            sub_score: None,
            findings: vec![finding],
            output: combined,
            duration_ms: raw.duration_ms,
            timed_out: true,
        };
    }

    let exit_ok = raw.exit_code == Some(0);
    let findings = match spec.parser {
        OutputParser::PytestSummary => parse_pytest(&raw.stdout),
        OutputParser::RuffJson => parse_ruff_json(&raw.stdout),
        OutputParser::MypyText => parse_mypy(&combined),
        OutputParser::SemgrepJson => parse_semgrep_json(&raw.stdout),
        OutputParser::CargoText => parse_cargo(&combined),
        OutputParser::ExitCodeOnly => Vec::new(),
    };

    let error_count = findings.iter().filter(|f| f.severity == Severity::Error).count();
    let warning_count = findings.iter().filter(|f| f.severity == Severity::Warning).count();

    // Security passes unless it found error-severity issues; every other
    // check trusts the tool's exit code.
    let passed = match spec.kind {
        CheckKind::Security => error_count == 0,
        _ => exit_ok,
    };

    let hard_gate = match spec.kind {
        CheckKind::Tests => true,
        CheckKind::Security => error_count > 0,
        _ => false,
    };

    let sub_score = Some(sub_score(spec.kind, passed, error_count, warning_count, rules));

    ValidationResult {
        kind: spec.kind,
        passed,
        hard_gate,
        sub_score,
        findings,
        output: combined,
        duration_ms: raw.duration_ms,
        timed_out: false,
    }
}

/// Per-check sub-score in [0, 100].
pub fn sub_score(
    kind: CheckKind,
    passed: bool,
    errors: usize,
    warnings: usize,
    rules: &SubScoreRules,
) -> f64 {
    let score = match kind {
        CheckKind::Tests => {
            if passed {
                100.0
            } else {
                0.0
            }
        }
        CheckKind::Lint => {
            let error_penalty = (errors as f64 * rules.lint_error_penalty).min(rules.lint_error_penalty_max);
            let warning_penalty =
                (warnings as f64 * rules.lint_warning_penalty).min(rules.lint_warning_penalty_max);
            let mut s = 100.0 - error_penalty - warning_penalty;
            // Exit-code failures with no parseable findings still cost
            if !passed && errors == 0 && warnings == 0 {
                s -= rules.lint_error_penalty;
            }
            s
        }
        CheckKind::Format => {
            if passed {
                100.0
            } else {
                100.0 - rules.format_file_penalty * (errors.max(1) as f64)
            }
        }
        CheckKind::Typecheck => {
            let error_penalty =
                (errors as f64 * rules.typecheck_error_penalty).min(rules.typecheck_error_penalty_max);
            let warning_penalty = (warnings as f64 * rules.typecheck_warning_penalty)
                .min(rules.typecheck_warning_penalty_max);
            let mut s = 100.0 - error_penalty - warning_penalty;
            if !passed && errors == 0 && warnings == 0 {
                s -= rules.typecheck_error_penalty;
            }
            s
        }
        CheckKind::Security => {
            100.0 - errors as f64 * rules.security_error_penalty
                - warnings as f64 * rules.security_warning_penalty
        }
    };
    score.clamp(0.0, 100.0)
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    let mut combined = String::new();
    if !stdout.trim().is_empty() {
        combined.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(stderr.trim_end());
    }
    combined
}

fn parse_error_finding(output: &str) -> Finding {
    Finding {
        severity: Severity::Warning,
        file: String::new(),
        line: 0,
        message: crate::util::truncate(output.trim(), 200),
        rule: "parse_error".to_string(),
    }
}

/// Parse pytest's quiet output: FAILED lines plus the trailing summary.
fn parse_pytest(output: &str) -> Vec<Finding> {
    let mut findings = Vec::new();

    for line in output.lines() {
        if line.contains("FAILED") && line.contains("::") {
            let file = line
                .split("::")
                .next()
                .map(|f| f.trim().trim_start_matches("FAILED").trim().to_string())
                .unwrap_or_default();
            findings.push(Finding {
                severity: Severity::Error,
                file,
                line: 0,
                message: line.trim().to_string(),
                rule: "test_failure".to_string(),
            });
        } else if line.starts_with("ERROR") {
            findings.push(Finding {
                severity: Severity::Error,
                file: String::new(),
                line: 0,
                message: line.trim().to_string(),
                rule: "test_error".to_string(),
            });
        }
    }

    findings
}

/// Parse `ruff check --output-format=json`
fn parse_ruff_json(output: &str) -> Vec<Finding> {
    if output.trim().is_empty() {
        return Vec::new();
    }
    let items: Vec<serde_json::Value> = match serde_json::from_str(output) {
        Ok(v) => v,
        Err(_) => return vec![parse_error_finding(output)],
    };

    items
        .iter()
        .map(|item| Finding {
            severity: Severity::Warning,
            file: item.get("filename").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            line: item
                .get("location")
                .and_then(|l| l.get("row"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            message: item.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            rule: item.get("code").and_then(|v| v.as_str()).unwrap_or("ruff").to_string(),
        })
        .collect()
}

/// Parse mypy's `path:line: error: message [code]` lines
fn parse_mypy(output: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    for line in output.lines() {
        let severity = if line.contains(": error:") {
            Severity::Error
        } else if line.contains(": warning:") {
            Severity::Warning
        } else {
            continue;
        };

        let parts: Vec<&str> = line.splitn(4, ':').collect();
        let file = parts.first().map(|s| s.trim().to_string()).unwrap_or_default();
        let line_num = parts
            .get(1)
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0);
        let message = parts.get(3).map(|s| s.trim().to_string()).unwrap_or_else(|| line.to_string());

        let rule = if let (Some(start), Some(end)) = (message.rfind('['), message.rfind(']')) {
            if start < end {
                message[start + 1..end].to_string()
            } else {
                "mypy".to_string()
            }
        } else {
            "mypy".to_string()
        };

        findings.push(Finding { severity, file, line: line_num, message, rule });
    }
    findings
}

/// Parse semgrep's JSON report
fn parse_semgrep_json(output: &str) -> Vec<Finding> {
    if output.trim().is_empty() {
        return Vec::new();
    }
    let data: serde_json::Value = match serde_json::from_str(output) {
        Ok(v) => v,
        Err(_) => return vec![parse_error_finding(output)],
    };

    let results = match data.get("results").and_then(|v| v.as_array()) {
        Some(r) => r,
        None => return vec![parse_error_finding(output)],
    };

    results
        .iter()
        .map(|result| {
            let severity = match result
                .get("extra")
                .and_then(|e| e.get("severity"))
                .and_then(|v| v.as_str())
                .unwrap_or("INFO")
            {
                "ERROR" => Severity::Error,
                "WARNING" => Severity::Warning,
                _ => Severity::Info,
            };
            let rule = result
                .get("check_id")
                .and_then(|v| v.as_str())
                .map(|id| id.rsplit('.').next().unwrap_or(id).to_string())
                .unwrap_or_else(|| "semgrep".to_string());
            Finding {
                severity,
                file: result.get("path").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                line: result
                    .get("start")
                    .and_then(|s| s.get("line"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                message: result
                    .get("extra")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                rule,
            }
        })
        .collect()
}

/// Parse cargo's human-readable diagnostics
fn parse_cargo(output: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    let lines: Vec<&str> = output.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let severity = if trimmed.starts_with("error[") || trimmed.starts_with("error:") {
            // The final "error: could not compile" line restates earlier ones
            if trimmed.contains("could not compile") || trimmed.contains("aborting due to") {
                continue;
            }
            Severity::Error
        } else if trimmed.starts_with("warning:") {
            if trimmed.contains("generated") && trimmed.contains("warning") {
                continue;
            }
            Severity::Warning
        } else {
            continue;
        };

        // The location arrow usually follows on the next line or two
        let (file, line_num) = lines[i + 1..]
            .iter()
            .take(3)
            .find_map(|l| {
                let l = l.trim_start();
                l.strip_prefix("--> ").map(|loc| {
                    let mut parts = loc.rsplitn(3, ':');
                    let _col = parts.next();
                    let line_num = parts.next().and_then(|n| n.parse::<u32>().ok()).unwrap_or(0);
                    let file = parts.next().unwrap_or("").to_string();
                    (file, line_num)
                })
            })
            .unwrap_or_default();

        let message = trimmed
            .splitn(2, ':')
            .nth(1)
            .map(|m| m.trim().to_string())
            .unwrap_or_else(|| trimmed.to_string());

        findings.push(Finding {
            severity,
            file,
            line: line_num,
            message,
            rule: "cargo".to_string(),
        });
    }

    findings
}

/// Whether the repo's own tests were touched alongside source changes.
/// Used by the risk model's missing-tests contribution.
pub fn is_test_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    let file_name = Path::new(&lower)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or("");

    lower.starts_with("tests/")
        || lower.contains("/tests/")
        || lower.contains("/test/")
        || file_name.starts_with("test_")
        || file_name.ends_with("_test.py")
        || file_name.ends_with("_test.go")
        || file_name.ends_with(".test.ts")
        || file_name.ends_with(".test.tsx")
        || file_name.ends_with(".test.js")
        || file_name.ends_with(".spec.ts")
        || file_name.ends_with(".spec.js")
}

/// Rough "is this a source file" test for coverage risk
pub fn is_source_path(path: &str) -> bool {
    if is_test_path(path) {
        return false;
    }
    let ext = Path::new(path).extension().and_then(|e| e.to_str()).unwrap_or("");
    matches!(ext, "rs" | "py" | "ts" | "tsx" | "js" | "jsx" | "go" | "java" | "rb" | "c" | "cc" | "cpp" | "h")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn rules() -> SubScoreRules {
        SubScoreRules::default()
    }

    fn raw(exit: i32, stdout: &str, stderr: &str) -> RawOutcome {
        RawOutcome {
            exit_code: Some(exit),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            duration_ms: 10,
            timed_out: false,
        }
    }

    #[test]
    fn test_detect_project_types() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(detect_project_type(tmp.path()), ProjectType::Unknown);
        fs::write(tmp.path().join("pyproject.toml"), "").unwrap();
        assert_eq!(detect_project_type(tmp.path()), ProjectType::Python);
        fs::write(tmp.path().join("Cargo.toml"), "").unwrap();
        assert_eq!(detect_project_type(tmp.path()), ProjectType::Rust);
    }

    #[test]
    fn test_python_validator_table_respects_toggles() {
        let mut toggles = ValidationToggles::default();
        toggles.run_security = false;
        let specs = validators_for(ProjectType::Python, &toggles);
        assert!(specs.iter().any(|s| s.kind == CheckKind::Tests));
        assert!(specs.iter().any(|s| s.kind == CheckKind::Lint));
        assert!(!specs.iter().any(|s| s.kind == CheckKind::Security));
    }

    #[test]
    fn test_tests_check_is_always_hard_gate() {
        let spec = ValidatorSpec::new(CheckKind::Tests, "pytest", &["-q"], OutputParser::PytestSummary);
        let result = aggregate(&spec, &raw(1, "FAILED tests/test_api.py::test_login - boom", ""), &rules());
        assert!(!result.passed);
        assert!(result.hard_gate);
        assert_eq!(result.sub_score, Some(0.0));
        assert_eq!(result.findings[0].rule, "test_failure");
        assert_eq!(result.findings[0].file, "tests/test_api.py");
    }

    #[test]
    fn test_ruff_json_findings() {
        let spec = ValidatorSpec::new(CheckKind::Lint, "ruff", &[], OutputParser::RuffJson);
        let output = r#"[{"filename":"src/app.py","location":{"row":3,"column":1},"message":"unused import","code":"F401"}]"#;
        let result = aggregate(&spec, &raw(1, output, ""), &rules());
        assert!(!result.passed);
        assert!(!result.hard_gate);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].rule, "F401");
        assert_eq!(result.findings[0].line, 3);
    }

    #[test]
    fn test_unparseable_ruff_output_becomes_parse_error() {
        let spec = ValidatorSpec::new(CheckKind::Lint, "ruff", &[], OutputParser::RuffJson);
        let result = aggregate(&spec, &raw(1, "Traceback (most recent call last)", ""), &rules());
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].rule, "parse_error");
    }

    #[test]
    fn test_mypy_parse_extracts_location_and_rule() {
        let output = "src/api.py:42: error: Incompatible return value type [return-value]\nsrc/api.py:50: warning: unused ignore";
        let findings = parse_mypy(output);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].file, "src/api.py");
        assert_eq!(findings[0].line, 42);
        assert_eq!(findings[0].rule, "return-value");
        assert_eq!(findings[1].severity, Severity::Warning);
    }

    #[test]
    fn test_semgrep_error_severity_is_hard_gate() {
        let spec = ValidatorSpec::new(CheckKind::Security, "semgrep", &[], OutputParser::SemgrepJson);
        let output = r#"{"results":[{"path":"src/auth.py","start":{"line":7},"extra":{"severity":"ERROR","message":"sql injection"},"check_id":"python.lang.security.sqli"}]}"#;
        let result = aggregate(&spec, &raw(0, output, ""), &rules());
        assert!(!result.passed);
        assert!(result.hard_gate);
        assert_eq!(result.findings[0].rule, "sqli");
    }

    #[test]
    fn test_semgrep_info_findings_pass() {
        let spec = ValidatorSpec::new(CheckKind::Security, "semgrep", &[], OutputParser::SemgrepJson);
        let output = r#"{"results":[{"path":"src/app.py","start":{"line":2},"extra":{"severity":"INFO","message":"note"},"check_id":"x.note"}]}"#;
        let result = aggregate(&spec, &raw(0, output, ""), &rules());
        assert!(result.passed);
        assert!(!result.hard_gate);
    }

    #[test]
    fn test_cargo_parse_counts_errors_and_warnings() {
        let output = "warning: unused variable: `x`\n  --> src/lib.rs:10:9\nerror[E0308]: mismatched types\n  --> src/lib.rs:20:5\nerror: could not compile `demo` (lib) due to 1 previous error";
        let findings = parse_cargo(output);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[0].file, "src/lib.rs");
        assert_eq!(findings[0].line, 10);
        assert_eq!(findings[1].severity, Severity::Error);
        assert_eq!(findings[1].line, 20);
    }

    #[test]
    fn test_timeout_is_failed_result_not_crash() {
        let spec = ValidatorSpec::new(CheckKind::Lint, "ruff", &[], OutputParser::RuffJson);
        let raw = RawOutcome {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 120_000,
            timed_out: true,
        };
        let result = aggregate(&spec, &raw, &rules());
        assert!(!result.passed);
        assert!(result.timed_out);
        assert_eq!(result.sub_score, None);
        assert_eq!(result.findings[0].rule, "timeout");
        // A timed-out lint does not gate; a timed-out test run would
        assert!(!result.hard_gate);
    }

    #[test]
    fn test_aggregation_is_deterministic() {
        let spec = ValidatorSpec::new(CheckKind::Lint, "ruff", &[], OutputParser::RuffJson);
        let outcome = raw(1, r#"[{"filename":"a.py","location":{"row":1,"column":1},"message":"m","code":"E1"}]"#, "");
        let a = aggregate(&spec, &outcome, &rules());
        let b = aggregate(&spec, &outcome, &rules());
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.sub_score, b.sub_score);
        assert_eq!(a.findings.len(), b.findings.len());
    }

    #[test]
    fn test_test_path_detection() {
        assert!(is_test_path("tests/test_api.py"));
        assert!(is_test_path("src/auth/login_test.go"));
        assert!(is_test_path("src/Button.test.tsx"));
        assert!(!is_test_path("src/auth/login.py"));
        assert!(is_source_path("src/auth/login.py"));
        assert!(!is_source_path("docs/readme.md"));
    }
}
