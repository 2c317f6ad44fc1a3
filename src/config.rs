//! Configuration management for patchgate
//!
//! Stores settings in ~/.config/patchgate/config.json. Scoring weights,
//! decision thresholds and risk factors all live here so they can be
//! changed without touching code; the engine receives them by value at
//! call time.

use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const KEYRING_SERVICE: &str = "patchgate";
const KEYRING_USERNAME: &str = "openrouter_api_key";

fn keyring_entry() -> Result<Entry, keyring::Error> {
    Entry::new(KEYRING_SERVICE, KEYRING_USERNAME)
}

fn read_keyring_key() -> Result<Option<String>, keyring::Error> {
    let entry = keyring_entry()?;
    match entry.get_password() {
        Ok(key) => Ok(Some(key)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

fn write_keyring_key(key: &str) -> Result<(), keyring::Error> {
    let entry = keyring_entry()?;
    entry.set_password(key)
}

/// Fixed per-check weights for the quality score. Must sum to 1.0 over the
/// full check set; a skipped check scores 0, it is never dropped from the
/// denominator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub tests: f64,
    pub typecheck: f64,
    pub security: f64,
    pub lint: f64,
    pub format: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            tests: 0.40,
            typecheck: 0.25,
            security: 0.15,
            lint: 0.15,
            format: 0.05,
        }
    }
}

/// Decision thresholds. Gates are evaluated before any of these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringThresholds {
    pub quality_approve: f64,
    pub quality_review: f64,
    pub risk_review: f64,
    pub risk_reject: f64,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            quality_approve: 80.0,
            quality_review: 60.0,
            risk_review: 0.3,
            risk_reject: 0.7,
        }
    }
}

/// A threshold step: once the measured quantity exceeds `over`, the factor
/// takes `value` (the highest matching step wins).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepRule {
    pub over: usize,
    pub value: f64,
}

/// Per-factor risk configuration. Every contribution is `value * cap` with
/// value in [0, 1], so `cap` is also the factor's maximum contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub diff_size_cap: f64,
    pub diff_size_steps: Vec<StepRule>,
    pub sensitive_path_cap: f64,
    pub sensitive_path_value: f64,
    pub sensitive_keyword_value: f64,
    pub sensitive_paths: Vec<String>,
    pub sensitive_keywords: Vec<String>,
    pub missing_tests_cap: f64,
    pub missing_tests_value: f64,
    pub complexity_cap: f64,
    pub complexity_steps: Vec<StepRule>,
    pub dependency_cap: f64,
    pub dependency_manifest_value: f64,
    pub dependency_lockfile_value: f64,
    pub dependency_manifests: Vec<String>,
    pub dependency_lockfiles: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            diff_size_cap: 0.15,
            diff_size_steps: vec![
                StepRule { over: 50, value: 0.2 },
                StepRule { over: 100, value: 0.4 },
                StepRule { over: 200, value: 0.7 },
                StepRule { over: 500, value: 1.0 },
            ],
            sensitive_path_cap: 0.25,
            sensitive_path_value: 0.9,
            sensitive_keyword_value: 0.6,
            sensitive_paths: vec![
                "auth/".to_string(),
                "security/".to_string(),
                "payment/".to_string(),
                "config/".to_string(),
                "settings/".to_string(),
                "secrets/".to_string(),
                "credentials/".to_string(),
            ],
            sensitive_keywords: vec![
                "auth".to_string(),
                "login".to_string(),
                "password".to_string(),
                "secret".to_string(),
                "token".to_string(),
                "credential".to_string(),
                "payment".to_string(),
                "billing".to_string(),
            ],
            missing_tests_cap: 0.20,
            missing_tests_value: 0.5,
            complexity_cap: 0.10,
            complexity_steps: vec![
                StepRule { over: 5, value: 0.2 },
                StepRule { over: 10, value: 0.4 },
                StepRule { over: 20, value: 0.7 },
                StepRule { over: 30, value: 1.0 },
            ],
            dependency_cap: 0.15,
            dependency_manifest_value: 0.8,
            dependency_lockfile_value: 0.9,
            dependency_manifests: vec![
                "Cargo.toml".to_string(),
                "package.json".to_string(),
                "pyproject.toml".to_string(),
                "requirements.txt".to_string(),
                "setup.py".to_string(),
                "go.mod".to_string(),
            ],
            dependency_lockfiles: vec![
                "Cargo.lock".to_string(),
                "package-lock.json".to_string(),
                "poetry.lock".to_string(),
                "go.sum".to_string(),
            ],
        }
    }
}

/// Penalty knobs for per-check sub-scores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SubScoreRules {
    pub lint_error_penalty: f64,
    pub lint_error_penalty_max: f64,
    pub lint_warning_penalty: f64,
    pub lint_warning_penalty_max: f64,
    pub typecheck_error_penalty: f64,
    pub typecheck_error_penalty_max: f64,
    pub typecheck_warning_penalty: f64,
    pub typecheck_warning_penalty_max: f64,
    pub security_error_penalty: f64,
    pub security_warning_penalty: f64,
    pub format_file_penalty: f64,
}

impl Default for SubScoreRules {
    fn default() -> Self {
        Self {
            lint_error_penalty: 5.0,
            lint_error_penalty_max: 50.0,
            lint_warning_penalty: 2.0,
            lint_warning_penalty_max: 20.0,
            typecheck_error_penalty: 10.0,
            typecheck_error_penalty_max: 60.0,
            typecheck_warning_penalty: 2.0,
            typecheck_warning_penalty_max: 20.0,
            security_error_penalty: 25.0,
            security_warning_penalty: 5.0,
            format_file_penalty: 25.0,
        }
    }
}

/// Retry policy for the retryable stages (generation, sandbox execution).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff: base * multiplier^(attempt - 1).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base = self.base_delay_ms as f64;
        let delay = base * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis(delay as u64)
    }
}

/// Resource bounds for one sandbox execution.
///
/// Wall-clock budgets are always enforced; cpu/memory caps are applied
/// best-effort via ulimit on unix hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub per_check_timeout_secs: u64,
    pub overall_timeout_secs: u64,
    pub cpu_seconds: Option<u64>,
    pub memory_kb: Option<u64>,
    pub allow_network: bool,
    pub max_output_chars: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            per_check_timeout_secs: 120,
            overall_timeout_secs: 300,
            cpu_seconds: None,
            memory_kb: None,
            allow_network: false,
            max_output_chars: 8_000,
        }
    }
}

/// Hard operational limits on a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLimits {
    pub max_files_per_run: usize,
    pub max_diff_lines: usize,
    pub retrieval_top_k: usize,
    /// Path fragments a patch may never touch
    pub forbidden_patterns: Vec<String>,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_files_per_run: 10,
            max_diff_lines: 500,
            retrieval_top_k: 20,
            forbidden_patterns: vec![
                ".git/".to_string(),
                ".env".to_string(),
                "__pycache__".to_string(),
                "node_modules/".to_string(),
                "secrets".to_string(),
                "credentials".to_string(),
            ],
        }
    }
}

/// Which checks the validation stage runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidationToggles {
    pub run_tests: bool,
    pub run_lint: bool,
    pub run_format: bool,
    pub run_typecheck: bool,
    pub run_security: bool,
}

impl Default for ValidationToggles {
    fn default() -> Self {
        Self {
            run_tests: true,
            run_lint: true,
            run_format: true,
            run_typecheck: true,
            run_security: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Legacy plaintext key slot; prefer the env var or system keychain
    pub openrouter_api_key: Option<String>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub thresholds: ScoringThresholds,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub sub_scores: SubScoreRules,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sandbox: SandboxLimits,
    #[serde(default)]
    pub limits: RunLimits,
    #[serde(default)]
    pub validation: ValidationToggles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub planner: String,
    pub generator: String,
    pub explainer: String,
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            planner: "anthropic/claude-sonnet-4".to_string(),
            generator: "anthropic/claude-sonnet-4".to_string(),
            explainer: "deepseek/deepseek-chat".to_string(),
            max_tokens: 8192,
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchgate"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        eprintln!(
                            "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Load from an explicit path; errors instead of silently defaulting so
    /// a bad --config flag is a startup failure, not a misconfigured run.
    pub fn load_from(path: &std::path::Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir).map_err(|e| format!("Failed to create config directory: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)) {
                eprintln!("  Warning: Failed to set config directory permissions: {}", e);
            }
        }

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        #[cfg(unix)]
        {
            write_config_atomic(&path, &content)
                .map_err(|e| format!("Failed to write config: {}", e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        Ok(())
    }

    /// Get the OpenRouter API key (from environment or keychain)
    pub fn get_api_key(&self) -> Option<String> {
        // Environment variable takes precedence
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            return Some(key);
        }

        match read_keyring_key() {
            Ok(Some(key)) => return Some(key),
            Ok(None) => {}
            Err(err) => {
                eprintln!("  Warning: Failed to read API key from system keychain: {}", err);
                eprintln!("  Tip: Set the OPENROUTER_API_KEY environment variable as a workaround.");
            }
        }

        self.openrouter_api_key.clone()
    }

    /// Set and save the API key
    pub fn set_api_key(&mut self, key: &str) -> Result<(), String> {
        if let Err(write_err) = write_keyring_key(key) {
            return Err(format!(
                "Failed to store API key in system keychain: {}. \
                 You can set the OPENROUTER_API_KEY environment variable instead.",
                write_err
            ));
        }

        // Verify the write succeeded by reading it back
        match read_keyring_key() {
            Ok(Some(stored_key)) if stored_key == key => {
                self.openrouter_api_key = None;
                self.save()
            }
            Ok(_) => Err(
                "API key verification failed: stored key doesn't match. \
                 You can set the OPENROUTER_API_KEY environment variable instead."
                    .to_string(),
            ),
            Err(read_err) => Err(format!(
                "API key verification failed: couldn't read back from keychain ({}). \
                 You can set the OPENROUTER_API_KEY environment variable instead.",
                read_err
            )),
        }
    }

    /// Validate API key format (should start with sk-)
    pub fn validate_api_key_format(key: &str) -> bool {
        key.starts_with("sk-")
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/patchgate/config.json".to_string())
    }
}

/// Interactive prompt to set up the OpenRouter API key
pub fn setup_api_key_interactive() -> Result<String, String> {
    use std::io::{self, Write};

    println!();
    println!("  OPENROUTER SETUP");
    println!();
    println!("  patchgate uses OpenRouter for planning, patch generation and review.");
    println!();
    println!("  1. Get an API key at: https://openrouter.ai/keys");
    println!("  2. Paste it below (saved in your system keychain when available)");
    println!();
    print!("  API Key: ");
    io::stdout().flush().map_err(|e| e.to_string())?;

    let mut key = String::new();
    io::stdin().read_line(&mut key).map_err(|e| e.to_string())?;
    let key = key.trim().to_string();

    if key.is_empty() {
        return Err("No API key provided".to_string());
    }

    if !Config::validate_api_key_format(&key) {
        println!();
        println!("  Warning: Key doesn't look like an OpenRouter key (should start with sk-)");
        println!("     Saving anyway...");
    }

    let mut config = Config::load();
    config.set_api_key(&key)?;

    println!();
    println!("  + API key saved to {}", Config::config_location());
    println!();

    Ok(key)
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &std::path::Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
        eprintln!("  Warning: Failed to set temp config file permissions: {}", e);
    }

    file.write_all(content.as_bytes()).map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}
