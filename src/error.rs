//! Pipeline error taxonomy
//!
//! Classifies failures by how the orchestrator must react: transient
//! errors are retried with backoff, everything else terminates the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Infrastructure hiccup (rate limit, flaky network, worktree race).
    /// Retried with exponential backoff on the retryable stages.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// The generated diff does not apply cleanly. This is a generation
    /// failure surfaced upward, never retried at the apply stage.
    #[error("patch does not apply: {0}")]
    PatchApply(String),

    /// The generation capability refused the task (policy or otherwise).
    #[error("generation refused: {0}")]
    GenerationRefused(String),

    /// Bad configuration. Fatal at startup, never a per-run condition.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Isolation could not be verified; the run aborts rather than risk
    /// unsandboxed execution.
    #[error("sandbox isolation failure: {0}")]
    SandboxIsolation(String),

    /// External cancellation request.
    #[error("cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stage failed for a non-transient, non-special reason.
    #[error("{stage} failed: {detail}")]
    Stage { stage: &'static str, detail: String },
}

impl PipelineError {
    /// Whether the retry policy may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientInfra(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_infra_errors_are_transient() {
        assert!(PipelineError::TransientInfra("429".into()).is_transient());
        assert!(!PipelineError::PatchApply("rejected hunk".into()).is_transient());
        assert!(!PipelineError::GenerationRefused("policy".into()).is_transient());
        assert!(!PipelineError::Cancelled.is_transient());
    }
}
