//! Patch generation via OpenRouter
//!
//! The generation capability behind the pipeline: plan a change from
//! retrieved context, emit a unified diff per planned file, and explain the
//! final change set. Model output is untrusted text; plans and diffs are
//! extracted and validated before anything downstream sees them.

use crate::retrieve::CodeChunk;
use crate::run::TaskType;
use crate::validate::ValidationResult;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// How generation failed; transient failures are retried by the
/// orchestrator, refusals are terminal.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("transient generation failure: {0}")]
    Transient(String),
    #[error("generation refused: {0}")]
    Refused(String),
}

/// A structured change plan produced before any diff is written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePlan {
    pub description: String,
    pub files_to_modify: Vec<String>,
    pub changes: Vec<PlannedChange>,
    pub rationale: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedChange {
    pub file_path: String,
    pub change_type: String,
    pub description: String,
}

/// Inputs for the explanation stage
#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub task_description: String,
    pub diff: String,
    pub check_summary: String,
    pub quality_score: f64,
    pub risk_score: f64,
}

#[async_trait]
pub trait PatchGenerator: Send + Sync {
    async fn plan_change(
        &self,
        task_type: TaskType,
        task_description: &str,
        context: &[CodeChunk],
    ) -> Result<ChangePlan, GenerationError>;

    async fn generate_diff(
        &self,
        file_path: &str,
        current_content: &str,
        change_description: &str,
    ) -> Result<String, GenerationError>;

    async fn explain(&self, request: &ExplainRequest) -> Result<String, GenerationError>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

const PLAN_SYSTEM_PROMPT: &str = r#"You are a senior software architect planning code changes.

Analyze the requested change and the provided code context to create a structured change plan.

RULES:
1. Keep changes minimal and focused
2. Limit scope to essential modifications
3. Consider dependencies and side effects
4. Set confidence level (0.0-1.0) based on context clarity

OUTPUT: JSON only, with this structure:
{
    "description": "Brief description of the planned changes",
    "files_to_modify": ["list of file paths"],
    "changes": [
        {
            "file_path": "<actual file path from the code context>",
            "change_type": "modify|add|refactor",
            "description": "What will be changed"
        }
    ],
    "rationale": "Why these changes are needed",
    "confidence": 0.0
}

IMPORTANT: Only use file paths that appear in the code context. Do not invent paths."#;

const DIFF_SYSTEM_PROMPT: &str = r#"You are an expert code refactoring assistant. Your ONLY output should be a unified diff patch.

Rules:
1. Output ONLY a valid unified diff, nothing else
2. Start with --- a/filepath and +++ b/filepath
3. Include @@ line numbers for each hunk
4. Use - for removed lines, + for added lines, space for context
5. Include 3 lines of context around changes
6. Do NOT include explanations, markdown, or any other text
7. Keep changes minimal and preserve existing code style"#;

const EXPLAIN_SYSTEM_PROMPT: &str = r#"You are a code review assistant. Explain code changes clearly and concisely.

Provide:
1. A brief summary of what was changed
2. The reasoning behind each change
3. Any potential concerns or edge cases

Be factual and avoid speculation."#;

/// OpenRouter-backed generator
pub struct OpenRouterGenerator {
    client: reqwest::Client,
    api_key: String,
    planner_model: String,
    generator_model: String,
    explainer_model: String,
    max_tokens: u32,
}

impl OpenRouterGenerator {
    pub fn new(api_key: String, model: &crate::config::ModelConfig) -> Self {
        // Suspension on the model is bounded; a hung request surfaces as a
        // transient failure instead of stalling the run
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            planner_model: model.planner.clone(),
            generator_model: model.generator.clone(),
            explainer_model: model.explainer.clone(),
            max_tokens: model.max_tokens,
        }
    }

    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                Message { role: "system".to_string(), content: system.to_string() },
                Message { role: "user".to_string(), content: user.to_string() },
            ],
            max_tokens: self.max_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", "https://github.com/patchgate")
            .header("X-Title", "patchgate")
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::Transient(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // Rate limits and server trouble are worth retrying; anything
            // else (bad key, policy refusal) is not
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(GenerationError::Transient(format!("API error {}: {}", status, text)));
            }
            return Err(GenerationError::Refused(format!("API error {}: {}", status, text)));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Transient(format!("Failed to parse response: {}", e)))?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| GenerationError::Transient("No response from model".to_string()))
    }
}

#[async_trait]
impl PatchGenerator for OpenRouterGenerator {
    async fn plan_change(
        &self,
        task_type: TaskType,
        task_description: &str,
        context: &[CodeChunk],
    ) -> Result<ChangePlan, GenerationError> {
        let context_text = format_context(context);
        let prompt = format!(
            "Task: {}\nTask Type: {}\n\nCode Context:\n{}\n\nCreate a structured change plan. Output JSON only.",
            task_description,
            task_type.as_str(),
            context_text,
        );

        let response = self.chat(&self.planner_model, PLAN_SYSTEM_PROMPT, &prompt).await?;
        parse_plan(&response)
    }

    async fn generate_diff(
        &self,
        file_path: &str,
        current_content: &str,
        change_description: &str,
    ) -> Result<String, GenerationError> {
        let prompt = format!(
            "File: {}\n\nCurrent content:\n```\n{}\n```\n\nRequested change:\n{}\n\nOutput the unified diff:",
            file_path, current_content, change_description,
        );

        let response = self.chat(&self.generator_model, DIFF_SYSTEM_PROMPT, &prompt).await?;
        let diff = extract_diff(&response);
        if diff.is_empty() {
            return Err(GenerationError::Transient(
                "Model output contained no unified diff".to_string(),
            ));
        }
        Ok(diff)
    }

    async fn explain(&self, request: &ExplainRequest) -> Result<String, GenerationError> {
        let prompt = format!(
            "Explain the following code changes:\n\nTask: {}\n\nQuality Score: {}\nRisk Score: {}\n\nDiff:\n```\n{}\n```\n\nValidation Results:\n{}\n\nProvide a clear, concise explanation of the changes.",
            request.task_description,
            request.quality_score,
            request.risk_score,
            request.diff,
            request.check_summary,
        );

        self.chat(&self.explainer_model, EXPLAIN_SYSTEM_PROMPT, &prompt).await
    }
}

fn format_context(context: &[CodeChunk]) -> String {
    if context.is_empty() {
        return "No relevant code context found. Analyze the repository structure.".to_string();
    }
    let parts: Vec<String> = context
        .iter()
        .take(10)
        .map(|chunk| {
            format!(
                "File: {}\nLines: {}-{}\n```\n{}\n```",
                chunk.path, chunk.start_line, chunk.end_line, chunk.text
            )
        })
        .collect();
    parts.join("\n---\n")
}

/// Parse the planner's JSON, tolerating markdown fences around it
pub fn parse_plan(response: &str) -> Result<ChangePlan, GenerationError> {
    let cleaned = strip_code_fences(response);
    let json: serde_json::Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| GenerationError::Transient(format!("Failed to parse plan JSON: {}", e)))?;

    let changes = json
        .get("changes")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .map(|c| PlannedChange {
                    file_path: c.get("file_path").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    change_type: c
                        .get("change_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("modify")
                        .to_string(),
                    description: c
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                })
                .filter(|c| !c.file_path.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let plan = ChangePlan {
        description: json.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        files_to_modify: json
            .get("files_to_modify")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter().filter_map(|v| v.as_str()).map(String::from).collect()
            })
            .unwrap_or_default(),
        changes,
        rationale: json.get("rationale").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        confidence: json.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5),
    };

    if plan.changes.is_empty() {
        return Err(GenerationError::Transient("Plan contained no changes".to_string()));
    }
    Ok(plan)
}

fn strip_code_fences(response: &str) -> String {
    let mut text = response.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim().to_string()
}

/// Pull a unified diff out of model output: prefer a ```diff fence, fall
/// back to the first `---`/`diff --git` line onward.
pub fn extract_diff(response: &str) -> String {
    let fence = Regex::new(r"(?s)```diff\n(.*?)\n```").expect("static regex");
    if let Some(captures) = fence.captures(response) {
        return captures[1].trim().to_string();
    }

    let trimmed = response.trim();
    if trimmed.starts_with("---") || trimmed.starts_with("diff --git") {
        return strip_trailing_fence(trimmed);
    }

    let mut diff_lines = Vec::new();
    let mut in_diff = false;
    for line in response.lines() {
        if line.starts_with("---") || line.starts_with("diff --git") {
            in_diff = true;
        }
        if in_diff {
            if line.starts_with("```") {
                break;
            }
            diff_lines.push(line);
        }
    }
    diff_lines.join("\n").trim().to_string()
}

fn strip_trailing_fence(text: &str) -> String {
    text.lines()
        .take_while(|line| !line.starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Deterministic fallback used when the explanation model is unavailable
pub fn format_check_summary(results: &[ValidationResult]) -> String {
    if results.is_empty() {
        return "No validation results available.".to_string();
    }
    let mut lines = Vec::new();
    for result in results {
        let status = if result.passed { "PASSED" } else { "FAILED" };
        let detail = if result.passed {
            String::new()
        } else {
            format!(
                " ({} errors, {} warnings)",
                result.error_count(),
                result.warning_count()
            )
        };
        lines.push(format!("- {}: {}{}", result.kind.as_str(), status, detail));
    }
    lines.join("\n")
}
