//! Error types for the phaseflow engine.
//!
//! This module holds the stable error-code taxonomy exposed to clients and
//! the top-level error enum used by fallible library APIs. Stage-side errors
//! live in [`crate::stages::StageError`], transition rejections in
//! [`crate::fsm::TransitionRejection`].

use crate::fsm::TransitionRejection;
use crate::repository::RepositoryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Machine-readable error codes.
///
/// The string form of every variant is stable across versions so clients
/// can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A required stage input was not available.
    ValidationMissingField,
    /// A stage input could not be parsed into the declared shape.
    ValidationInvalidFormat,
    /// An external resource could not be reached.
    ResourceUnavailable,
    /// An external resource did not answer in time.
    ResourceTimeout,
    /// A stage failed after exhausting its attempts.
    StageProcessingFailed,
    /// A stage attempt exceeded its configured timeout.
    StageTimeout,
    /// A stage checkpoint could not be persisted.
    StageCheckpointFailed,
    /// The run was not in a state that allows the requested operation.
    PipelineInvalidState,
    /// No stage implementation is registered under the configured name.
    AgentNotFound,
    /// A state machine transition was rejected mid-run.
    PipelineInvalidTransition,
    /// The run was cancelled.
    PipelineCancelled,
}

impl ErrorCode {
    /// All codes, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::ValidationMissingField,
        Self::ValidationInvalidFormat,
        Self::ResourceUnavailable,
        Self::ResourceTimeout,
        Self::StageProcessingFailed,
        Self::StageTimeout,
        Self::StageCheckpointFailed,
        Self::PipelineInvalidState,
        Self::AgentNotFound,
        Self::PipelineInvalidTransition,
        Self::PipelineCancelled,
    ];

    /// Returns the stable string form of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationMissingField => "VALIDATION_MISSING_FIELD",
            Self::ValidationInvalidFormat => "VALIDATION_INVALID_FORMAT",
            Self::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            Self::ResourceTimeout => "RESOURCE_TIMEOUT",
            Self::StageProcessingFailed => "STAGE_PROCESSING_FAILED",
            Self::StageTimeout => "STAGE_TIMEOUT",
            Self::StageCheckpointFailed => "STAGE_CHECKPOINT_FAILED",
            Self::PipelineInvalidState => "PIPELINE_INVALID_STATE",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::PipelineInvalidTransition => "PIPELINE_INVALID_TRANSITION",
            Self::PipelineCancelled => "PIPELINE_CANCELLED",
        }
    }

    /// Returns true if errors with this code are transient by nature.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ResourceUnavailable | Self::ResourceTimeout | Self::StageTimeout
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| format!("Unknown error code: {s}"))
    }
}

/// The main error type for phaseflow operations.
#[derive(Debug, Error)]
pub enum PhaseflowError {
    /// Configuration was rejected.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The run state repository failed.
    #[error("{0}")]
    Repository(#[from] RepositoryError),

    /// A state machine transition was rejected.
    #[error("Transition rejected: {0}")]
    Transition(#[from] TransitionRejection),

    /// A run was not found.
    #[error("Run not found: {0}")]
    RunNotFound(uuid::Uuid),

    /// A message failed construction-time validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PhaseflowError {
    /// Maps the error onto the client-facing code taxonomy, if one applies.
    #[must_use]
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Transition(_) => Some(ErrorCode::PipelineInvalidTransition),
            Self::RunNotFound(_) => Some(ErrorCode::PipelineInvalidState),
            Self::InvalidMessage(_) | Self::Serialization(_) => {
                Some(ErrorCode::ValidationInvalidFormat)
            }
            Self::Repository(_) => Some(ErrorCode::StageCheckpointFailed),
            Self::Config(_) => None,
        }
    }
}

/// Error raised when a coordinator or stage configuration is invalid.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No stages were configured.
    #[error("Configuration declares no stages")]
    NoStages,

    /// A stage name was empty or whitespace-only.
    #[error("Stage name cannot be empty or whitespace-only")]
    EmptyStageName,

    /// Two stages share a name.
    #[error("Duplicate stage name: '{0}'")]
    DuplicateStage(String),

    /// A stage was configured with zero attempts.
    #[error("Stage '{0}' must allow at least one attempt")]
    ZeroAttempts(String),

    /// A stage was configured with a zero timeout.
    #[error("Stage '{0}' must have a positive timeout")]
    ZeroTimeout(String),

    /// A stage was assigned to a state that does not run stages.
    #[error("Stage '{stage}' is assigned to non-running state '{state}'")]
    NonRunningState {
        /// The stage name.
        stage: String,
        /// The offending state.
        state: String,
    },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
