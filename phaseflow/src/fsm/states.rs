//! Pipeline states and events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a run.
///
/// The three running states are the run's phases in order; in the document
/// pipeline they are parse, generate and render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Created, not yet started.
    #[default]
    Idle,
    /// First phase running.
    RunningA,
    /// Second phase running.
    RunningB,
    /// Third phase running.
    RunningC,
    /// All phases finished.
    Complete,
    /// A phase failed.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

impl PipelineState {
    /// All states, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Idle,
        Self::RunningA,
        Self::RunningB,
        Self::RunningC,
        Self::Complete,
        Self::Failed,
        Self::Cancelled,
    ];

    /// The states that execute stages, in execution order.
    pub const RUNNING: [Self; 3] = [Self::RunningA, Self::RunningB, Self::RunningC];

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RunningA => "running_a",
            Self::RunningB => "running_b",
            Self::RunningC => "running_c",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for states that end a run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Returns true for states that execute stages.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::RunningA | Self::RunningB | Self::RunningC)
    }

    /// Returns the event that completes this running state.
    #[must_use]
    pub const fn completion_event(&self) -> Option<PipelineEvent> {
        match self {
            Self::RunningA => Some(PipelineEvent::PhaseADone),
            Self::RunningB => Some(PipelineEvent::PhaseBDone),
            Self::RunningC => Some(PipelineEvent::PhaseCDone),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid pipeline state: {s}"))
    }
}

/// Something that happened to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Begin the run.
    Start,
    /// First phase finished.
    PhaseADone,
    /// Second phase finished.
    PhaseBDone,
    /// Third phase finished.
    PhaseCDone,
    /// A phase failed.
    Error,
    /// Cancellation was observed.
    Cancel,
    /// Re-run a failed run from the first phase.
    Retry,
    /// Return a finished run to idle.
    Reset,
}

impl PipelineEvent {
    /// All events.
    pub const ALL: [Self; 8] = [
        Self::Start,
        Self::PhaseADone,
        Self::PhaseBDone,
        Self::PhaseCDone,
        Self::Error,
        Self::Cancel,
        Self::Retry,
        Self::Reset,
    ];

    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::PhaseADone => "phase_a_done",
            Self::PhaseBDone => "phase_b_done",
            Self::PhaseCDone => "phase_c_done",
            Self::Error => "error",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
            Self::Reset => "reset",
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| format!("Invalid pipeline event: {s}"))
    }
}
