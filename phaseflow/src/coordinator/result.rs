//! Per-stage and aggregate run results.

use crate::errors::ErrorCode;
use crate::fsm::PipelineState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one stage, after all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// The stage name.
    pub stage: String,
    /// Whether an attempt succeeded.
    pub success: bool,
    /// Output of the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Error of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Code of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Time spent across all attempts, backoff included.
    pub elapsed_ms: f64,
    /// Attempts used.
    pub retry_attempts: u32,
}

impl StageResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(
        stage: impl Into<String>,
        payload: serde_json::Value,
        elapsed_ms: f64,
        retry_attempts: u32,
    ) -> Self {
        Self {
            stage: stage.into(),
            success: true,
            payload: Some(payload),
            error: None,
            error_code: None,
            elapsed_ms,
            retry_attempts,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(
        stage: impl Into<String>,
        error: impl Into<String>,
        code: ErrorCode,
        elapsed_ms: f64,
        retry_attempts: u32,
    ) -> Self {
        Self {
            stage: stage.into(),
            success: false,
            payload: None,
            error: Some(error.into()),
            error_code: Some(code),
            elapsed_ms,
            retry_attempts,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorResult {
    /// The run.
    pub run_id: Uuid,
    /// Whether every stage succeeded and the run completed.
    pub success: bool,
    /// Results of the stages that ran, in execution order.
    pub stage_results: Vec<StageResult>,
    /// All checkpoints merged into one object.
    pub output: serde_json::Value,
    /// Why the run did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable form of `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// State the run ended in.
    pub final_state: PipelineState,
    /// Wall time of the run, in milliseconds.
    pub elapsed_ms: f64,
}

impl CoordinatorResult {
    /// Returns the result of a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stage_results.iter().find(|r| r.stage == name)
    }

    /// Returns true if the run ended cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.final_state == PipelineState::Cancelled
    }

    /// Total attempts across all stages.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.stage_results.iter().map(|r| r.retry_attempts).sum()
    }
}
