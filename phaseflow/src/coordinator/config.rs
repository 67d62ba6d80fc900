//! Coordinator and stage configuration.

use super::RetryConfig;
use crate::context::DEFAULT_MAX_RETRIES;
use crate::errors::ConfigError;
use crate::fsm::{PhaseRequirements, PipelineState, DEFAULT_INPUT_KEY};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default per-attempt timeout.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of attempts per stage.
pub const DEFAULT_STAGE_ATTEMPTS: u32 = 3;

/// One configured stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Registry key and checkpoint name.
    pub name: String,
    /// Inputs that must resolve to a run field or an earlier checkpoint.
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Inputs passed along when present.
    #[serde(default)]
    pub optional_inputs: Vec<String>,
    /// Per-attempt timeout, serialized as seconds.
    #[serde(default = "default_timeout", with = "seconds")]
    pub timeout: Duration,
    /// Attempt bound; 1 means no retries.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// The running state whose group this stage belongs to.
    pub state: PipelineState,
}

const fn default_timeout() -> Duration {
    DEFAULT_STAGE_TIMEOUT
}

const fn default_retry_count() -> u32 {
    DEFAULT_STAGE_ATTEMPTS
}

impl StageConfig {
    /// Creates a stage config with default timeout and attempts.
    pub fn new(name: impl Into<String>, state: PipelineState) -> Self {
        Self {
            name: name.into(),
            required_inputs: Vec::new(),
            optional_inputs: Vec::new(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            retry_count: DEFAULT_STAGE_ATTEMPTS,
            state,
        }
    }

    /// Adds a required input.
    #[must_use]
    pub fn requires(mut self, input: impl Into<String>) -> Self {
        self.required_inputs.push(input.into());
        self
    }

    /// Adds an optional input.
    #[must_use]
    pub fn accepts(mut self, input: impl Into<String>) -> Self {
        self.optional_inputs.push(input.into());
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the attempt bound.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Validates the stage configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyStageName);
        }
        if self.retry_count == 0 {
            return Err(ConfigError::ZeroAttempts(self.name.clone()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout(self.name.clone()));
        }
        if !self.state.is_running() {
            return Err(ConfigError::NonRunningState {
                stage: self.name.clone(),
                state: self.state.to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration of a [`super::StageCoordinator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Stages in declaration order.
    pub stages: Vec<StageConfig>,
    /// Whole-run retry bound given to new runs.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff between stage attempts.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Input field the start guard requires.
    #[serde(default = "default_input_key")]
    pub input_key: String,
    /// Whether snapshots are written to the repository.
    #[serde(default = "default_save_snapshots")]
    pub save_snapshots: bool,
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_input_key() -> String {
    DEFAULT_INPUT_KEY.to_string()
}

const fn default_save_snapshots() -> bool {
    true
}

impl CoordinatorConfig {
    /// Creates a config over `stages` with default settings.
    #[must_use]
    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self {
            stages,
            max_retries: DEFAULT_MAX_RETRIES,
            retry: RetryConfig::default(),
            input_key: default_input_key(),
            save_snapshots: true,
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets the backoff between attempts.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the whole-run retry bound.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the input field the start guard requires.
    #[must_use]
    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        self.input_key = key.into();
        self
    }

    /// Enables or disables snapshot writes.
    #[must_use]
    pub const fn with_save_snapshots(mut self, enabled: bool) -> Self {
        self.save_snapshots = enabled;
        self
    }

    /// Validates stage names, attempt bounds and state assignment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
        }
        Ok(())
    }

    /// Stages grouped by running state, in state order. Declaration order is
    /// kept within a group; a state without stages yields an empty group.
    #[must_use]
    pub fn groups(&self) -> Vec<(PipelineState, Vec<&StageConfig>)> {
        PipelineState::RUNNING
            .into_iter()
            .map(|state| {
                let stages = self.stages.iter().filter(|s| s.state == state).collect();
                (state, stages)
            })
            .collect()
    }

    /// Guard requirements derived from the stage assignment.
    #[must_use]
    pub fn phase_requirements(&self) -> PhaseRequirements {
        PhaseRequirements::from_stages(
            self.input_key.clone(),
            self.stages.iter().map(|s| (s.name.as_str(), s.state)),
        )
    }
}

/// Serializes a [`Duration`] as fractional seconds.
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
